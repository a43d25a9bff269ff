//! Read, write, CRUD and error-path workloads against the user API

use super::fixtures::{random_user, unique_email};
use super::{user_metrics, ErrorPolicy, Step, USERS_CREATED, USERS_DELETED};
use crate::context::IterationContext;
use crate::dispatcher::Workload;
use crate::transport::{Request, Response};
use async_trait::async_trait;
use barrage_core::{MetricKind, Tags};
use rand::Rng;
use serde_json::{json, Value};
use std::time::Duration;

const READ_BUDGET: Duration = Duration::from_secs(1);
const WRITE_BUDGET: Duration = Duration::from_secs(2);

fn operation_tags(step: &Step) -> Tags {
    let mut tags = Tags::new();
    tags.insert("operation".to_string(), step.operation.to_string());
    tags
}

fn echoes_email(response: &Response, email: &str) -> bool {
    response
        .json::<Value>()
        .is_some_and(|body| body["email"] == email)
}

// ============================================================================
// READ
// ============================================================================

const HEALTH_CHECK: Step = Step::new("health_check", &[200], ErrorPolicy::Unexpected);
const LIST_USERS: Step = Step::new("list_users", &[200, 404], ErrorPolicy::Unexpected);
const GET_USER: Step = Step::new("get_user", &[200, 404], ErrorPolicy::Unexpected);

/// Health check, list users, fetch one user that may not exist
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadWorkload;

#[async_trait]
impl Workload for ReadWorkload {
    fn name(&self) -> &str {
        "read"
    }

    fn metrics(&self) -> Vec<(&'static str, MetricKind)> {
        user_metrics()
    }

    async fn execute(&self, ctx: &IterationContext) {
        let n: u32 = rand::thread_rng().gen_range(0..100);
        let plan = [
            (HEALTH_CHECK, Request::get("/health")),
            (LIST_USERS, Request::get("/api/users")),
            (GET_USER, Request::get(format!("/api/users/user{}@test.com", n))),
        ];

        for (step, request) in plan {
            step.perform_checked(ctx, request, |r| {
                vec![
                    (format!("{} status ok", step.operation), step.status_ok(r)),
                    (
                        format!("{} response time < 1s", step.operation),
                        r.elapsed < READ_BUDGET,
                    ),
                ]
            })
            .await;
        }
    }
}

// ============================================================================
// WRITE
// ============================================================================

const CREATE_USER: Step = Step::new("create_user", &[201], ErrorPolicy::ClientOrServer);
const UPDATE_USER: Step = Step::new("update_user", &[200], ErrorPolicy::ClientOrServer);

/// Create a user, then rename it if creation fully succeeded
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteWorkload;

#[async_trait]
impl Workload for WriteWorkload {
    fn name(&self) -> &str {
        "write"
    }

    fn metrics(&self) -> Vec<(&'static str, MetricKind)> {
        user_metrics()
    }

    async fn execute(&self, ctx: &IterationContext) {
        let user = random_user();
        let email = unique_email(user.email);

        let create = Request::post("/api/users", user.payload(&email));
        let created = CREATE_USER
            .perform_checked(ctx, create, |r| {
                vec![
                    ("user creation status is 201".into(), r.status == 201),
                    ("user creation response time < 2s".into(), r.elapsed < WRITE_BUDGET),
                    ("user creation returns user data".into(), echoes_email(r, &email)),
                ]
            })
            .await;
        if !created {
            return;
        }
        ctx.add_counter(USERS_CREATED, 1.0, &operation_tags(&CREATE_USER));

        let update = json!({ "name": format!("{} Updated", user.name) });
        UPDATE_USER
            .perform_checked(ctx, Request::patch(format!("/api/users/{}", email), update), |r| {
                vec![
                    ("user update status is 200".into(), r.status == 200),
                    ("user update response time < 2s".into(), r.elapsed < WRITE_BUDGET),
                ]
            })
            .await;
    }
}

// ============================================================================
// CRUD
// ============================================================================

const CRUD_CREATE: Step = Step::new("crud_create", &[201], ErrorPolicy::ClientOrServer);
const CRUD_READ: Step = Step::new("crud_read", &[200], ErrorPolicy::ClientOrServer);
const CRUD_UPDATE: Step = Step::new("crud_update", &[200], ErrorPolicy::ClientOrServer);
const CRUD_DELETE: Step = Step::new("crud_delete", &[204], ErrorPolicy::ClientOrServer);

/// Create, read, update and delete one user.
///
/// Nothing past creation runs unless creation returned 201.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrudWorkload;

#[async_trait]
impl Workload for CrudWorkload {
    fn name(&self) -> &str {
        "crud"
    }

    fn metrics(&self) -> Vec<(&'static str, MetricKind)> {
        user_metrics()
    }

    async fn execute(&self, ctx: &IterationContext) {
        let user = random_user();
        let email = unique_email(user.email);
        let path = format!("/api/users/{}", email);

        let created = CRUD_CREATE
            .perform_checked(ctx, Request::post("/api/users", user.payload(&email)), |r| {
                vec![("crud create status is 201".into(), r.status == 201)]
            })
            .await;
        if !created {
            return;
        }
        ctx.add_counter(USERS_CREATED, 1.0, &operation_tags(&CRUD_CREATE));

        CRUD_READ
            .perform_checked(ctx, Request::get(path.as_str()), |r| {
                vec![("crud read status is 200".into(), r.status == 200)]
            })
            .await;

        // Fixtures carry no active flag, so toggling it always activates
        let update = json!({
            "name": format!("{} CRUD Updated", user.name),
            "active": true,
        });
        CRUD_UPDATE
            .perform_checked(ctx, Request::patch(path.as_str(), update), |r| {
                vec![("crud update status is 200".into(), r.status == 200)]
            })
            .await;

        let deleted = CRUD_DELETE
            .perform_checked(ctx, Request::delete(path.as_str()), |r| {
                vec![("crud delete status is 204".into(), r.status == 204)]
            })
            .await;
        if deleted {
            ctx.add_counter(USERS_DELETED, 1.0, &operation_tags(&CRUD_DELETE));
        }
    }
}

// ============================================================================
// ERROR PATHS
// ============================================================================

const MISSING_USER: Step = Step::new("error_404", &[404], ErrorPolicy::Unexpected);
const INVALID_USER: Step = Step::new("error_400", &[400, 422], ErrorPolicy::Unexpected);
// Targets without the debug endpoints answer 404, which is not an error
const FORCED_500: Step = Step::new("error_500", &[500, 404], ErrorPolicy::Unexpected);
const FORCED_PANIC: Step = Step::new("panic_test", &[500, 404], ErrorPolicy::Unexpected);

/// Deliberately provoke 404, 400/422 and 500 responses
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorPathWorkload;

#[async_trait]
impl Workload for ErrorPathWorkload {
    fn name(&self) -> &str {
        "errors"
    }

    fn metrics(&self) -> Vec<(&'static str, MetricKind)> {
        user_metrics()
    }

    async fn execute(&self, ctx: &IterationContext) {
        let invalid = json!({ "name": "", "email": "invalid-email", "password": "123" });
        let cases = [
            (
                MISSING_USER,
                Request::get("/api/users/inexistente@test.com"),
                "expected 404 for non-existent user",
            ),
            (
                INVALID_USER,
                Request::post("/api/users", invalid),
                "expected 400 for invalid user data",
            ),
            (
                FORCED_500,
                Request::get("/test/error500"),
                "expected 500 for error endpoint",
            ),
            (FORCED_PANIC, Request::get("/test/panic"), "panic endpoint handled"),
        ];

        for (step, request, check) in cases {
            step.perform_checked(ctx, request, |r| vec![(check.to_string(), step.status_ok(r))])
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::workloads::{API_LATENCY, ERRORS};
    use crate::transport::{Method, Transport};
    use barrage_core::{names, MetricSink};
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Answers by method and path prefix, remembering every request
    struct Scripted {
        routes: Vec<(Method, &'static str, u16)>,
        latency: Duration,
        seen: Mutex<Vec<(Method, Option<Value>)>>,
    }

    impl Scripted {
        fn new(routes: Vec<(Method, &'static str, u16)>) -> Arc<Self> {
            Self::slow(routes, Duration::from_millis(20))
        }

        fn slow(routes: Vec<(Method, &'static str, u16)>, latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                routes,
                latency,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn methods(&self) -> Vec<Method> {
            self.seen.lock().iter().map(|(m, _)| *m).collect()
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn invoke(&self, request: &Request) -> Result<Response, TransportError> {
            self.seen
                .lock()
                .push((request.method, request.body.clone()));
            let status = self
                .routes
                .iter()
                .find(|(m, prefix, _)| *m == request.method && request.path.starts_with(prefix))
                .map_or(404, |(_, _, status)| *status);
            // Echo the body so creation checks see their email
            let body = request
                .body
                .as_ref()
                .map(|b| b.to_string())
                .unwrap_or_default();
            Ok(Response::new(status, body, self.latency))
        }
    }

    /// Every request fails before a response arrives
    struct Refusing;

    #[async_trait]
    impl Transport for Refusing {
        async fn invoke(&self, _request: &Request) -> Result<Response, TransportError> {
            Err(TransportError::Other("connection refused".to_string()))
        }
    }

    fn context<T: Transport + 'static>(transport: Arc<T>) -> (IterationContext, Arc<MetricSink>) {
        let sink = Arc::new(MetricSink::with_builtin_schema());
        for (name, kind) in user_metrics() {
            sink.declare(name, kind).unwrap();
        }
        let ctx = IterationContext::new(transport, Arc::clone(&sink), Tags::new(), 1, 0);
        (ctx, sink)
    }

    fn counter(sink: &MetricSink, name: &str) -> f64 {
        sink.snapshot(name)
            .and_then(|aggregate| aggregate.sum())
            .unwrap_or(0.0)
    }

    #[tokio::test]
    async fn test_crud_failed_create_issues_no_delete() {
        let transport = Scripted::new(vec![(Method::Post, "/api/users", 500)]);
        let (ctx, sink) = context(Arc::clone(&transport));

        CrudWorkload.execute(&ctx).await;

        assert_eq!(transport.methods(), vec![Method::Post]);
        assert_eq!(counter(&sink, USERS_CREATED), 0.0);
        assert_eq!(counter(&sink, USERS_DELETED), 0.0);
        assert_eq!(sink.snapshot(ERRORS).unwrap().rate(), Some(1.0));
    }

    #[tokio::test]
    async fn test_crud_full_cycle() {
        let transport = Scripted::new(vec![
            (Method::Post, "/api/users", 201),
            (Method::Get, "/api/users/", 200),
            (Method::Patch, "/api/users/", 200),
            (Method::Delete, "/api/users/", 204),
        ]);
        let (ctx, sink) = context(Arc::clone(&transport));

        CrudWorkload.execute(&ctx).await;

        assert_eq!(
            transport.methods(),
            vec![Method::Post, Method::Get, Method::Patch, Method::Delete]
        );
        assert_eq!(counter(&sink, USERS_CREATED), 1.0);
        assert_eq!(counter(&sink, USERS_DELETED), 1.0);
        assert_eq!(sink.snapshot(ERRORS).unwrap().rate(), Some(0.0));
        assert_eq!(sink.snapshot(API_LATENCY).unwrap().sample_count(), 4);
    }

    #[tokio::test]
    async fn test_crud_failed_delete_not_counted() {
        let transport = Scripted::new(vec![
            (Method::Post, "/api/users", 201),
            (Method::Get, "/api/users/", 200),
            (Method::Patch, "/api/users/", 200),
            (Method::Delete, "/api/users/", 500),
        ]);
        let (ctx, sink) = context(transport);

        CrudWorkload.execute(&ctx).await;

        assert_eq!(counter(&sink, USERS_DELETED), 0.0);
        assert_eq!(sink.snapshot(ERRORS).unwrap().rate(), Some(0.25));
    }

    #[tokio::test]
    async fn test_write_updates_only_after_create() {
        let transport = Scripted::new(vec![
            (Method::Post, "/api/users", 201),
            (Method::Patch, "/api/users/", 200),
        ]);
        let (ctx, sink) = context(Arc::clone(&transport));

        WriteWorkload.execute(&ctx).await;

        assert_eq!(transport.methods(), vec![Method::Post, Method::Patch]);
        assert_eq!(counter(&sink, USERS_CREATED), 1.0);
        assert_eq!(sink.snapshot(names::CHECKS).unwrap().rate(), Some(1.0));
    }

    #[tokio::test]
    async fn test_read_tolerates_missing_users() {
        let transport = Scripted::new(vec![(Method::Get, "/health", 200)]);
        let (ctx, sink) = context(transport);

        ReadWorkload.execute(&ctx).await;

        // list and get answer 404, which the read steps expect
        assert_eq!(sink.snapshot(ERRORS).unwrap().rate(), Some(0.0));
        assert_eq!(sink.snapshot(names::HTTP_REQ_FAILED).unwrap().rate(), Some(2.0 / 3.0));
    }

    #[tokio::test]
    async fn test_error_paths_are_not_errors() {
        let transport = Scripted::new(vec![
            (Method::Post, "/api/users", 400),
            (Method::Get, "/test/", 500),
        ]);
        let (ctx, sink) = context(transport);

        ErrorPathWorkload.execute(&ctx).await;

        assert_eq!(sink.snapshot(ERRORS).unwrap().rate(), Some(0.0));
        assert_eq!(sink.snapshot(names::CHECKS).unwrap().rate(), Some(1.0));
    }

    #[tokio::test]
    async fn test_unexpected_error_path_status_is_error() {
        let transport = Scripted::new(vec![(Method::Get, "/test/", 502)]);
        let (ctx, sink) = context(transport);

        ErrorPathWorkload.execute(&ctx).await;

        let mut selector = Tags::new();
        selector.insert("operation".to_string(), "error_500".to_string());
        assert_eq!(
            sink.snapshot_matching(ERRORS, &selector).unwrap().rate(),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn test_failed_check_counts_as_error() {
        let transport = Scripted::slow(
            vec![
                (Method::Get, "/health", 200),
                (Method::Get, "/api/users", 200),
            ],
            Duration::from_millis(1500),
        );
        let (ctx, sink) = context(transport);

        ReadWorkload.execute(&ctx).await;

        // Every status is expected but each response misses the 1s budget
        assert_eq!(sink.snapshot(ERRORS).unwrap().rate(), Some(1.0));
        assert_eq!(sink.snapshot(ERRORS).unwrap().sample_count(), 3);
        assert_eq!(sink.snapshot(names::CHECKS).unwrap().rate(), Some(0.5));
    }

    #[tokio::test]
    async fn test_transport_failures_are_errors() {
        let (ctx, sink) = context(Arc::new(Refusing));

        ReadWorkload.execute(&ctx).await;

        assert_eq!(sink.snapshot(ERRORS).unwrap().rate(), Some(1.0));
        assert_eq!(sink.snapshot(ERRORS).unwrap().sample_count(), 3);
        assert_eq!(sink.snapshot(names::HTTP_REQ_FAILED).unwrap().rate(), Some(1.0));
        assert_eq!(sink.snapshot(API_LATENCY).unwrap().sample_count(), 0);
        assert_eq!(sink.snapshot(names::CHECKS).unwrap().sample_count(), 0);
    }

    #[tokio::test]
    async fn test_crud_refused_create_stops_cycle() {
        let (ctx, sink) = context(Arc::new(Refusing));

        CrudWorkload.execute(&ctx).await;

        assert_eq!(sink.snapshot(ERRORS).unwrap().rate(), Some(1.0));
        assert_eq!(sink.snapshot(ERRORS).unwrap().sample_count(), 1);
        assert_eq!(counter(&sink, USERS_CREATED), 0.0);
    }

    #[tokio::test]
    async fn test_crud_update_activates_user() {
        let transport = Scripted::new(vec![
            (Method::Post, "/api/users", 201),
            (Method::Get, "/api/users/", 200),
            (Method::Patch, "/api/users/", 200),
            (Method::Delete, "/api/users/", 204),
        ]);
        let (ctx, _sink) = context(Arc::clone(&transport));

        CrudWorkload.execute(&ctx).await;

        let seen = transport.seen.lock();
        let update = seen
            .iter()
            .find(|(m, _)| *m == Method::Patch)
            .and_then(|(_, body)| body.clone())
            .unwrap();
        assert_eq!(update["active"], true);
        assert!(update["name"].as_str().unwrap().ends_with("CRUD Updated"));
    }
}
