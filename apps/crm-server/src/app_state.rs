use crm_core::activity::ActivityLog;
use crm_core::customer::CustomerDirectory;
use crm_core::lifecycle::LeadLifecycle;
use crm_core::notify::AdminNotifier;
use crm_events::{AdminRoom, Bus};
use crm_kernel::Kernel;

/// Shared service state. Everything inside is cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    pub kernel: Kernel,
    pub room: AdminRoom,
    pub notifier: AdminNotifier,
    pub leads: LeadLifecycle,
    pub customers: CustomerDirectory,
    pub activities: ActivityLog,
}

impl AppState {
    pub fn new(kernel: Kernel, events_capacity: usize, replay_cap: usize) -> Self {
        let room = AdminRoom::new(Bus::new(events_capacity), replay_cap);
        let notifier = AdminNotifier::new(room.clone());
        Self {
            leads: LeadLifecycle::new(kernel.clone(), notifier.clone()),
            customers: CustomerDirectory::new(kernel.clone()),
            activities: ActivityLog::new(kernel.clone()),
            kernel,
            room,
            notifier,
        }
    }
}
