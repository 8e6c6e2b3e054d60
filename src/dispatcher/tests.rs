//! Dispatcher Tests
//!
//! ## Test Scopes
//! - **Resolution**: service paths, registry lookups, unknown actors.
//! - **Settlement**: ack ordering and requeue on failure.
//! - **Failures**: errors and panics become error-shaped results.
//! - **Streaming**: intermediate messages go out while the operation runs.
//! - **Abandonment**: a dispatch dropped before settling requeues.

#[cfg(test)]
mod tests {
    use crate::dispatcher::*;
    use crate::packet::{Outbound, Packet, Request};
    use crate::transport::Acknowledger;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{Notify, mpsc};

    type Log = Arc<Mutex<Vec<String>>>;

    struct RecordingAcker {
        log: Log,
    }

    impl Acknowledger for RecordingAcker {
        fn ack(self: Box<Self>) {
            self.log.lock().push("ack".to_string());
        }

        fn reject(self: Box<Self>, requeue: bool) {
            self.log.lock().push(format!("reject:{}", requeue));
        }
    }

    fn acker(log: &Log) -> Box<dyn Acknowledger> {
        Box::new(RecordingAcker { log: log.clone() })
    }

    fn setup(actor: Actor) -> (Dispatcher, mpsc::UnboundedReceiver<Outbound>) {
        let registry = ActorRegistry::new();
        registry.register(actor);
        let (outbox, receiver) = mpsc::unbounded_channel();
        (Dispatcher::new("agent-1", registry, outbox), receiver)
    }

    fn request(service: &str, payload: Value) -> Request {
        Request::new(service, payload, "caller").with_reply_to("caller-inbox")
    }

    fn results_of(reply: Option<Outbound>) -> Value {
        match reply.map(|out| out.packet) {
            Some(Packet::Result(result)) => result.results,
            other => panic!("expected a result, got {:?}", other),
        }
    }

    fn logging_op(name: &str, log: &Log, fail: bool) -> Operation {
        let log = log.clone();
        Operation::new(name, move |payload, _| {
            let log = log.clone();
            async move {
                log.lock().push("invoke".to_string());
                if fail {
                    anyhow::bail!("operation failed on {}", payload);
                }
                Ok(payload)
            }
        })
    }

    // ============================================================
    // RESOLUTION
    // ============================================================

    #[test]
    fn test_resolve_service_paths() {
        assert_eq!(resolve("/calc/add"), ("calc".to_string(), "add".to_string()));
        assert_eq!(resolve("/calc"), ("calc".to_string(), "index".to_string()));
        assert_eq!(resolve("/a/b/c"), ("a/b".to_string(), "c".to_string()));
        assert_eq!(canonical_service("/calc/"), "/calc/index");
    }

    #[test]
    fn test_registry_lists_services() {
        let registry = ActorRegistry::new();
        registry.register(
            Actor::new("/calc")
                .expose("add", |payload, _| async move { Ok(payload) })
                .expose("index", |_, _| async { Ok(json!("calc")) }),
        );

        assert!(registry.has_actor("calc"));
        assert_eq!(registry.actor_count(), 1);
        assert_eq!(registry.services(), vec!["/calc/add", "/calc/index"]);
    }

    #[tokio::test]
    async fn test_bare_prefix_reaches_index() {
        let (dispatcher, _outbox) =
            setup(Actor::new("calc").expose("index", |_, _| async { Ok(json!("index")) }));
        let log = Log::default();

        let reply = dispatcher.dispatch(request("/calc", json!(null)), acker(&log)).await;

        assert_eq!(results_of(reply), json!("index"));
    }

    #[tokio::test]
    async fn test_unknown_actor_is_an_error_result() {
        let (dispatcher, _outbox) = setup(Actor::new("calc"));
        let log = Log::default();

        let reply = dispatcher
            .dispatch(request("/nope/add", json!(1)), acker(&log))
            .await;

        let descriptor = ErrorDescriptor::from_value(&results_of(reply)).unwrap();
        assert_eq!(descriptor.kind, "UnknownActor");
        assert_eq!(*log.lock(), vec!["ack"]);
    }

    #[tokio::test]
    async fn test_unknown_operation_is_an_error_result() {
        let (dispatcher, _outbox) = setup(Actor::new("calc"));
        let log = Log::default();

        let reply = dispatcher
            .dispatch(request("/calc/divide", json!(1)), acker(&log))
            .await;

        let descriptor = ErrorDescriptor::from_value(&results_of(reply)).unwrap();
        assert_eq!(descriptor.kind, "UnknownOperation");
        assert!(descriptor.message.contains("divide"));
    }

    // ============================================================
    // SETTLEMENT
    // ============================================================

    #[tokio::test]
    async fn test_default_acks_before_invocation() {
        let log = Log::default();
        let (dispatcher, _outbox) = setup(Actor::new("calc").operation(logging_op("add", &log, false)));

        let reply = dispatcher
            .dispatch(request("/calc/add", json!(3)), acker(&log))
            .await;

        assert_eq!(*log.lock(), vec!["ack", "invoke"]);
        assert_eq!(results_of(reply), json!(3));
    }

    #[tokio::test]
    async fn test_ack_on_success_acks_after_return() {
        let log = Log::default();
        let (dispatcher, _outbox) = setup(
            Actor::new("calc").operation(logging_op("add", &log, false).ack_on_success()),
        );

        dispatcher
            .dispatch(request("/calc/add", json!(3)), acker(&log))
            .await;

        assert_eq!(*log.lock(), vec!["invoke", "ack"]);
    }

    #[tokio::test]
    async fn test_requeue_on_failure_rejects_and_never_acks() {
        let log = Log::default();
        let (dispatcher, _outbox) = setup(
            Actor::new("calc").operation(logging_op("add", &log, true).requeue_on_failure()),
        );

        let reply = dispatcher
            .dispatch(request("/calc/add", json!(3)), acker(&log))
            .await;

        assert!(reply.is_none());
        assert_eq!(*log.lock(), vec!["invoke", "reject:true"]);
    }

    #[tokio::test]
    async fn test_requeue_operation_acks_on_success() {
        let log = Log::default();
        let (dispatcher, _outbox) = setup(
            Actor::new("calc").operation(logging_op("add", &log, false).requeue_on_failure()),
        );

        dispatcher
            .dispatch(request("/calc/add", json!(3)), acker(&log))
            .await;

        assert_eq!(*log.lock(), vec!["invoke", "ack"]);
    }

    #[tokio::test]
    async fn test_no_reply_to_means_no_reply() {
        let log = Log::default();
        let (dispatcher, _outbox) = setup(Actor::new("calc").operation(logging_op("add", &log, false)));

        let reply = dispatcher
            .dispatch(Request::new("/calc/add", json!(1), "caller"), acker(&log))
            .await;

        assert!(reply.is_none());
        assert_eq!(*log.lock(), vec!["ack", "invoke"]);
    }

    // ============================================================
    // FAILURES
    // ============================================================

    #[tokio::test]
    async fn test_failure_becomes_error_result_and_runs_hook() {
        let log = Log::default();
        let hooked: Log = Log::default();
        let hooked_clone = hooked.clone();

        let (dispatcher, _outbox) = setup(
            Actor::new("calc")
                .operation(logging_op("add", &log, true))
                .on_exception(move |descriptor, request| {
                    hooked_clone
                        .lock()
                        .push(format!("{}:{}", descriptor.kind, request.from));
                }),
        );

        let req = request("/calc/add", json!(3));
        let token = req.token.clone();
        let reply = dispatcher.dispatch(req, acker(&log)).await.unwrap();

        assert_eq!(reply.channel, "caller-inbox");
        let Packet::Result(result) = reply.packet else {
            panic!("expected a result");
        };
        assert_eq!(result.token, token);
        assert_eq!(result.to, "caller");
        assert_eq!(result.from, "agent-1");

        let descriptor = ErrorDescriptor::from_value(&result.results).unwrap();
        assert_eq!(descriptor.kind, "ActorExecutionError");
        assert!(descriptor.message.contains("operation failed"));

        assert_eq!(*hooked.lock(), vec!["ActorExecutionError:caller"]);
        assert_eq!(*log.lock(), vec!["ack", "invoke"]);
    }

    #[tokio::test]
    async fn test_error_trace_carries_causes() {
        let (dispatcher, _outbox) = setup(Actor::new("io").expose("read", |_, _| async {
            let cause = std::io::Error::other("disk gone");
            Err(anyhow::Error::new(cause).context("reading shard"))
        }));
        let log = Log::default();

        let reply = dispatcher
            .dispatch(request("/io/read", json!(null)), acker(&log))
            .await;

        let descriptor = ErrorDescriptor::from_value(&results_of(reply)).unwrap();
        assert_eq!(descriptor.message, "reading shard");
        assert_eq!(descriptor.trace, vec!["disk gone"]);
    }

    #[tokio::test]
    async fn test_panic_becomes_error_result() {
        let (dispatcher, _outbox) = setup(Actor::new("calc").expose("boom", |_, _| async {
            if true {
                panic!("kaboom");
            }
            Ok(json!(null))
        }));
        let log = Log::default();

        let reply = dispatcher
            .dispatch(request("/calc/boom", json!(null)), acker(&log))
            .await;

        let descriptor = ErrorDescriptor::from_value(&results_of(reply)).unwrap();
        assert_eq!(descriptor.kind, "ActorExecutionError");
        assert!(descriptor.message.contains("panicked"));
        assert_eq!(*log.lock(), vec!["ack"]);
    }

    // ============================================================
    // STREAMING
    // ============================================================

    #[tokio::test]
    async fn test_intermediate_messages_are_published_immediately() {
        let release = Arc::new(Notify::new());
        let gate = release.clone();
        let (dispatcher, mut outbox) = setup(Actor::new("calc").expose("count", move |payload, emitter| {
            let gate = gate.clone();
            async move {
                let upto = payload.as_u64().unwrap_or(0);
                for n in 1..=upto {
                    emitter.emit("progress", json!(n));
                }
                gate.notified().await;
                Ok(json!("done"))
            }
        }));
        let dispatcher = Arc::new(dispatcher);
        let log = Log::default();

        let req = request("/calc/count", json!(2));
        let token = req.token.clone();
        let running = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let log = log.clone();
            async move { dispatcher.dispatch(req, acker(&log)).await }
        });

        for expected in [1, 2] {
            let out = tokio::time::timeout(Duration::from_secs(5), outbox.recv())
                .await
                .expect("intermediate held back until the operation returned")
                .unwrap();
            assert_eq!(out.channel, "caller-inbox");
            let Packet::IntermediateMessage(message) = out.packet else {
                panic!("expected an intermediate message");
            };
            assert_eq!(message.token, token);
            assert_eq!(message.from, "agent-1");
            assert_eq!(message.messagekey, "progress");
            assert_eq!(message.message, json!(expected));
        }
        assert!(!running.is_finished());

        release.notify_one();
        let reply = running.await.unwrap();
        assert_eq!(results_of(reply), json!("done"));
    }

    #[tokio::test]
    async fn test_abandoned_dispatch_requeues() {
        let (dispatcher, _outbox) = setup(Actor::new("calc").operation(
            Operation::new("stall", |_, _| async move {
                std::future::pending::<()>().await;
                Ok(json!(null))
            })
            .ack_on_success(),
        ));
        let log = Log::default();

        let dispatch = dispatcher.dispatch(request("/calc/stall", json!(null)), acker(&log));
        let abandoned = tokio::time::timeout(Duration::from_millis(50), dispatch).await;

        assert!(abandoned.is_err());
        assert_eq!(*log.lock(), vec!["reject:true"]);
    }

    #[tokio::test]
    async fn test_with_request_shape_sees_the_request() {
        let (dispatcher, _outbox) = setup(Actor::new("who").expose_with_request(
            "index",
            |_, request, _| async move { Ok(json!(request.from)) },
        ));
        let log = Log::default();

        let reply = dispatcher
            .dispatch(request("/who", json!(null)), acker(&log))
            .await;

        assert_eq!(results_of(reply), json!("caller"));
    }
}
