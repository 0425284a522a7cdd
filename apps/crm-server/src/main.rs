use tracing::{error, info};

mod api_activities;
mod api_customers;
mod api_events;
mod api_leads;
mod api_users;
mod app_state;
mod config;
mod identity;
mod openapi;
mod problem;
mod router;

pub(crate) use app_state::AppState;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let addr = match config::bind_addr() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    let state_dir = config::state_dir();
    let kernel = match crm_kernel::Kernel::open(&state_dir) {
        Ok(kernel) => kernel,
        Err(err) => {
            eprintln!("error: failed to open state at {}: {err}", state_dir.display());
            std::process::exit(2);
        }
    };
    if let Err(err) = identity::bootstrap_admin(&kernel) {
        eprintln!("error: failed to bootstrap admin user: {err}");
        std::process::exit(2);
    }

    let state = AppState::new(kernel, config::events_capacity(), config::events_replay());
    state.room.emit(
        crm_topics::TOPIC_SERVICE_START,
        &serde_json::json!({"addr": addr.to_string()}),
    );
    let app = router::build(state.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("bind server socket");
    info!(%addr, "crm-server listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        error!("http server exited with error: {err}");
    }
    state.room.emit(crm_topics::TOPIC_SERVICE_STOP, &serde_json::json!({}));
    info!("crm-server stopped");
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}

#[cfg(test)]
mod http_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use crm_kernel::{Kernel, NewUser};
    use crm_protocol::Role;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tempfile::tempdir;
    use tower::util::ServiceExt;

    struct Harness {
        _dir: tempfile::TempDir,
        state: AppState,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempdir().expect("tempdir");
            let kernel = Kernel::open(dir.path()).expect("open kernel");
            for (email, role, token) in [
                ("admin@example.com", Role::Admin, "tok-admin"),
                ("alice@example.com", Role::User, "tok-alice"),
                ("bob@example.com", Role::User, "tok-bob"),
            ] {
                kernel
                    .insert_user(&NewUser {
                        email: email.into(),
                        role,
                        token_sha256: Some(identity::fingerprint(token)),
                    })
                    .expect("seed user");
            }
            let state = AppState::new(kernel, 32, 64);
            Self { _dir: dir, state }
        }

        fn router(&self) -> Router {
            router::build(self.state.clone())
        }

        async fn send(
            &self,
            method: &str,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut req = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                req = req.header("authorization", format!("Bearer {token}"));
            }
            let req = match body {
                Some(body) => req
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string())),
                None => req.body(Body::empty()),
            }
            .expect("build request");
            let resp = self.router().oneshot(req).await.expect("route request");
            let status = resp.status();
            let bytes = resp.into_body().collect().await.expect("read body").to_bytes();
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or(Value::Null)
            };
            (status, value)
        }
    }

    #[tokio::test]
    async fn requests_without_token_are_unauthorized() {
        let h = Harness::new();
        let (status, body) = h.send("GET", "/leads", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["title"], "Unauthorized");
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let h = Harness::new();
        let (status, body) = h.send("GET", "/healthz", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn lead_lifecycle_over_http() {
        let h = Harness::new();

        let (status, lead) = h
            .send(
                "POST",
                "/leads",
                Some("tok-alice"),
                Some(json!({"name": "Acme", "email": "c@acme.test"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = lead["id"].as_i64().unwrap();
        assert_eq!(lead["status"], "new");

        // foreign user is forbidden, admin is not
        let (status, _) = h
            .send(
                "POST",
                &format!("/leads/{id}/status"),
                Some("tok-bob"),
                Some(json!({"status": "contacted"})),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, lead) = h
            .send(
                "POST",
                &format!("/leads/{id}/status"),
                Some("tok-alice"),
                Some(json!({"status": "qualified", "note": "demo went well"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(lead["status"], "qualified");

        let (status, converted) = h
            .send("POST", &format!("/leads/{id}/convert"), Some("tok-alice"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(converted["status"], "won");
        let customer_id = converted["customer"]["id"].as_i64().unwrap();

        // idempotent second convert returns the same customer
        let (status, again) = h
            .send("POST", &format!("/leads/{id}/convert"), Some("tok-alice"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["customer"]["id"].as_i64(), Some(customer_id));

        // terminal: converted lead can be neither lost nor re-statused
        let (status, body) = h
            .send(
                "POST",
                &format!("/leads/{id}/lost"),
                Some("tok-alice"),
                Some(json!({"reason": "too late"})),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "invalid_state");

        // audit trail recorded both transitions
        let (status, page) = h
            .send(
                "GET",
                &format!("/activities?lead_id={id}"),
                Some("tok-alice"),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let entries = page["data"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        let mut kinds: Vec<&str> = entries.iter().map(|a| a["type"].as_str().unwrap()).collect();
        kinds.sort_unstable();
        assert_eq!(kinds, vec!["CONVERTED", "STATUS_CHANGED"]);
        let status_note = entries
            .iter()
            .find(|a| a["type"] == "STATUS_CHANGED")
            .unwrap();
        assert_eq!(
            status_note["note"],
            "Status: new → qualified. demo went well"
        );
    }

    #[tokio::test]
    async fn lost_lead_rejects_conversion() {
        let h = Harness::new();
        let (_, lead) = h
            .send("POST", "/leads", Some("tok-alice"), Some(json!({"name": "Acme"})))
            .await;
        let id = lead["id"].as_i64().unwrap();

        let (status, lead) = h
            .send("POST", &format!("/leads/{id}/lost"), Some("tok-alice"), Some(json!({})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(lead["status"], "lost");

        let (status, body) = h
            .send("POST", &format!("/leads/{id}/convert"), Some("tok-alice"), None)
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "invalid_state");
    }

    #[tokio::test]
    async fn activity_requires_exactly_one_target() {
        let h = Harness::new();
        let (status, body) = h
            .send(
                "POST",
                "/activities",
                Some("tok-alice"),
                Some(json!({"type": "CALL"})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation");
    }

    #[tokio::test]
    async fn admin_surface_is_admin_only() {
        let h = Harness::new();

        let (status, _) = h.send("GET", "/admin/users", Some("tok-alice"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = h.send("GET", "/admin/events", Some("tok-alice"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, users) = h.send("GET", "/admin/users", Some("tok-admin"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(users["items"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn role_change_notifies_admin_room() {
        let h = Harness::new();
        let (status, user) = h
            .send(
                "PATCH",
                "/admin/users/2/role",
                Some("tok-admin"),
                Some(json!({"role": "admin"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(user["role"], "admin");

        let buffered = h.state.room.replay_after(None);
        let event = buffered.last().expect("buffered notification");
        assert_eq!(event.kind, crm_topics::TOPIC_USERS_ROLE_CHANGED);
        assert_eq!(event.payload["type"], "USER_ROLE_CHANGED");
        assert_eq!(event.payload["entity"], "user");
    }

    #[tokio::test]
    async fn lead_creation_reaches_connected_admin_observer() {
        let h = Harness::new();
        let admin = crm_protocol::Principal {
            id: 1,
            role: Role::Admin,
            email: "admin@example.com".into(),
        };
        let mut sub = h.state.room.subscribe(&admin).expect("admin subscription");

        let (status, _) = h
            .send("POST", "/leads", Some("tok-alice"), Some(json!({"name": "Acme"})))
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let env = sub.recv().await.expect("delivered envelope");
        assert_eq!(env.kind, crm_topics::TOPIC_LEADS_CREATED);
        assert_eq!(env.payload["message"], "Lead created: Acme");
    }
}
