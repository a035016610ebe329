//! Lifecycle, queueing and reset behavior against a scripted sandbox.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use enclave::{
    BoxError, Error, InitScope, Processor, ResetReason, Value,
    wire::{Envelope, ErrorRecord, Request, RequestId, WireValue},
};

use crate::common::{self, expect_link, within};

#[tokio::test]
async fn queued_calls_flush_in_issue_order_once_running() -> Result<()> {
    let (transport, mut links) = common::transport();
    let processor = Processor::builder().build(transport);

    let script = async {
        let mut link = expect_link(&mut links).await;
        link.initialized().await;
        for expected in ["encode", "decode", "digest"] {
            let (id, request) = link.expect_request().await;
            let Request::CallModuleExport { export_name, .. } = request else {
                panic!("expected callModuleExport, got {request:?}");
            };
            assert_eq!(export_name, expected);
            link.respond(id, WireValue::text(expected)).await;
        }
        link
    };

    let (first, second, third, _link) = within(async {
        tokio::join!(
            processor.call_module_export("index", "encode", vec![]),
            processor.call_module_export("index", "decode", vec![]),
            processor.call_module_export("index", "digest", vec![]),
            script,
        )
    })
    .await;

    assert_eq!(first.context("first call")?, Value::text("encode"));
    assert_eq!(second.context("second call")?, Value::text("decode"));
    assert_eq!(third.context("third call")?, Value::text("digest"));
    Ok(())
}

#[tokio::test]
async fn activate_boots_the_sandbox_and_later_resolves_immediately() -> Result<()> {
    let (transport, mut links) = common::transport();
    let processor = Processor::builder().build(transport);

    let (result, _link) = within(async {
        tokio::join!(processor.activate(), async {
            let link = expect_link(&mut links).await;
            link.initialized().await;
            link
        })
    })
    .await;
    result.context("first activation")?;

    within(processor.activate()).await.context("second activation")?;
    assert!(links.try_recv().is_err(), "a second sandbox was spawned");
    Ok(())
}

#[tokio::test]
async fn queued_call_is_flushed_after_bootstrap_completes() -> Result<()> {
    let (transport, mut links) = common::transport();
    let processor = Processor::builder()
        .on_initialize(|scope| async move {
            scope
                .import_scripts(["https://extensions.example/hash.js"])
                .await?;
            Ok(())
        })
        .build(transport);

    let script = async {
        let mut link = expect_link(&mut links).await;
        link.initialized().await;

        // The bootstrap import is delivered while initializing, ahead of the
        // queued call.
        let (id, request) = link.expect_request().await;
        assert_eq!(
            request,
            Request::ImportScripts {
                urls: vec!["https://extensions.example/hash.js".to_string()],
            }
        );
        link.respond_empty(id).await;

        let (id, request) = link.expect_request().await;
        let Request::CallModuleExport {
            module_id,
            export_name,
            ..
        } = request
        else {
            panic!("expected callModuleExport, got {request:?}");
        };
        assert_eq!(module_id, "index");
        assert_eq!(export_name, "activate");
        link.respond(
            id,
            WireValue::List(vec![WireValue::Int(1), WireValue::text("ok")]),
        )
        .await;
        link
    };

    let (result, _link) = within(async {
        tokio::join!(
            processor.call_module_export("index", "activate", vec![Value::text("ctx")]),
            script,
        )
    })
    .await;
    assert_eq!(
        result.context("activate call")?,
        Value::List(vec![Value::Int(1), Value::text("ok")])
    );
    Ok(())
}

#[tokio::test]
async fn init_hook_failure_rejects_queued_calls() {
    let (transport, mut links) = common::transport();
    let (reasons, probe) = common::reset_probe();
    let processor = Processor::builder()
        .on_initialize(|_scope| async { Err(BoxError::from("catalog refused the bundle")) })
        .on_reset(probe)
        .build(transport);

    let script = async {
        let mut link = expect_link(&mut links).await;
        link.initialized().await;
        assert_eq!(link.recv().await, Envelope::Terminate);
    };

    let (result, ()) = within(async {
        tokio::join!(
            processor.call_module_export("index", "activate", vec![]),
            script,
        )
    })
    .await;

    let error = result.expect_err("queued call must be rejected");
    assert!(
        matches!(
            &error,
            Error::Reset(ResetReason::InitializeFailed(message))
                if message.contains("catalog refused")
        ),
        "unexpected error: {error:?}"
    );
    let reasons = reasons.lock().expect("probe lock");
    assert!(matches!(
        reasons.as_slice(),
        [ResetReason::InitializeFailed(_)]
    ));
}

#[tokio::test]
async fn response_with_unknown_id_resets_the_sandbox() {
    let (transport, mut links) = common::transport();
    let (reasons, probe) = common::reset_probe();
    let processor = Processor::builder().on_reset(probe).build(transport);

    let script = async {
        let mut link = expect_link(&mut links).await;
        link.initialized().await;
        let (id, _request) = link.expect_request().await;
        // Answer with an id that was never issued.
        link.respond(RequestId::new(id.get() + 1000), WireValue::Null)
            .await;
        assert_eq!(link.recv().await, Envelope::Terminate);
    };

    let (result, ()) = within(async {
        tokio::join!(processor.get_module_export("index", "meta"), script)
    })
    .await;

    assert!(matches!(
        result.expect_err("pending call must be rejected"),
        Error::Reset(ResetReason::Protocol(_))
    ));
    assert!(matches!(
        reasons.lock().expect("probe lock").as_slice(),
        [ResetReason::Protocol(_)]
    ));
}

#[tokio::test]
async fn sandbox_reported_call_failure_is_local_to_the_call() -> Result<()> {
    let (transport, mut links) = common::transport();
    let (reasons, probe) = common::reset_probe();
    let processor = Processor::builder().on_reset(probe).build(transport);

    let script = async {
        let mut link = expect_link(&mut links).await;
        link.initialized().await;
        let (id, _request) = link.expect_request().await;
        link.respond_error(
            id,
            WireValue::Error(ErrorRecord::new(
                "ExportMissingError",
                "module `index` has no export `missing`",
            )),
        )
        .await;
        let (id, _request) = link.expect_request().await;
        link.respond(id, WireValue::Int(7)).await;
        link
    };

    let (failed, succeeded, _link) = within(async {
        tokio::join!(
            processor.call_module_export("index", "missing", vec![]),
            processor.call_module_export("index", "digest", vec![]),
            script,
        )
    })
    .await;

    let error = failed.expect_err("missing export must fail");
    assert!(
        matches!(&error, Error::Sandbox { name, .. } if name == "ExportMissingError"),
        "unexpected error: {error:?}"
    );
    assert_eq!(succeeded.context("second call")?, Value::Int(7));
    assert!(
        reasons.lock().expect("probe lock").is_empty(),
        "a call-level failure must not reset"
    );
    Ok(())
}

#[tokio::test]
async fn bootstrap_requests_fail_fast_outside_initialization() -> Result<()> {
    let (transport, mut links) = common::transport();
    let stash: Arc<Mutex<Option<InitScope>>> = Arc::default();
    let hook_stash = Arc::clone(&stash);
    let processor = Processor::builder()
        .on_initialize(move |scope| {
            hook_stash.lock().expect("stash lock").replace(scope);
            async { Ok(()) }
        })
        .build(transport);

    let (result, _link) = within(async {
        tokio::join!(processor.activate(), async {
            let link = expect_link(&mut links).await;
            link.initialized().await;
            link
        })
    })
    .await;
    result.context("activation")?;

    let scope = stash
        .lock()
        .expect("stash lock")
        .take()
        .expect("initialize hook captured its scope");
    let error = within(scope.import_scripts(["https://late.example/extra.js"]))
        .await
        .expect_err("bootstrap call after running must fail");
    assert!(matches!(error, Error::NotInitializing));
    Ok(())
}

#[tokio::test]
async fn reset_rejects_pending_work_and_clears_the_callable_registry() {
    struct Silent;

    #[async_trait::async_trait]
    impl enclave::Callable for Silent {
        async fn call(&self, _args: Vec<Value>) -> Result<Value, BoxError> {
            Ok(Value::Null)
        }
    }

    let (transport, mut links) = common::transport();
    let (reasons, probe) = common::reset_probe();
    let processor = Arc::new(Processor::builder().on_reset(probe).build(transport));

    let pending = {
        let processor = Arc::clone(&processor);
        tokio::spawn(async move {
            processor
                .call_module_export("index", "activate", vec![Value::function(Silent)])
                .await
        })
    };

    let mut link = expect_link(&mut links).await;
    link.initialized().await;
    let (_id, request) = link.expect_request().await;
    let Request::CallModuleExport { mut args, .. } = request else {
        panic!("expected callModuleExport, got {request:?}");
    };
    let WireValue::Function(pointer) = args.remove(0) else {
        panic!("expected exported function pointer");
    };

    within(processor.reset()).await.expect("reset");
    let error = within(pending)
        .await
        .expect("join")
        .expect_err("pending call must be rejected by the reset");
    assert!(matches!(error, Error::Reset(ResetReason::Terminated)));
    assert_eq!(link.recv().await, Envelope::Terminate);

    // The processor stays usable: the next call boots a fresh sandbox.
    let reactivate = {
        let processor = Arc::clone(&processor);
        tokio::spawn(async move { processor.activate().await })
    };
    let mut link = expect_link(&mut links).await;
    link.initialized().await;
    within(reactivate)
        .await
        .expect("join")
        .expect("second activation");

    // The pointer exported to the previous instance is gone.
    link.send(Envelope::Request {
        id: RequestId::new(700),
        request: Request::CallFunctionPointer {
            pointer,
            args: vec![],
        },
    })
    .await;
    match link.recv().await {
        Envelope::Respond {
            id,
            response,
            error,
        } => {
            assert_eq!(id, RequestId::new(700));
            assert!(response.is_none());
            assert!(
                matches!(&error, Some(WireValue::Error(record)) if record.name == "ReferenceError"),
                "unexpected reply: {error:?}"
            );
        }
        other => panic!("expected respond envelope, got {other:?}"),
    }

    assert!(matches!(
        reasons.lock().expect("probe lock").as_slice(),
        [ResetReason::Terminated]
    ));
}

#[tokio::test]
async fn sandbox_error_notification_resets() {
    let (transport, mut links) = common::transport();
    let (reasons, probe) = common::reset_probe();
    let processor = Processor::builder().on_reset(probe).build(transport);

    let script = async {
        let mut link = expect_link(&mut links).await;
        link.initialized().await;
        let (_id, _request) = link.expect_request().await;
        link.send(Envelope::Error {
            error: WireValue::text("worker out of memory"),
        })
        .await;
        assert_eq!(link.recv().await, Envelope::Terminate);
    };

    let (result, ()) = within(async {
        tokio::join!(processor.get_module_export("index", "meta"), script)
    })
    .await;

    let error = result.expect_err("pending call must be rejected");
    assert!(
        matches!(
            &error,
            Error::Reset(ResetReason::Crashed(message)) if message.contains("out of memory")
        ),
        "unexpected error: {error:?}"
    );
    assert!(matches!(
        reasons.lock().expect("probe lock").as_slice(),
        [ResetReason::Crashed(_)]
    ));
}

#[tokio::test]
async fn concurrent_calls_settle_exactly_once_each() -> Result<()> {
    const CALLS: i64 = 8;

    let (transport, mut links) = common::transport();
    let processor = Arc::new(Processor::builder().build(transport));

    let handles: Vec<_> = (0..CALLS)
        .map(|i| {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move {
                processor
                    .call_module_export("index", "echo", vec![Value::Int(i)])
                    .await
            })
        })
        .collect();

    let mut link = expect_link(&mut links).await;
    link.initialized().await;
    let mut received = Vec::new();
    for _ in 0..CALLS {
        let (id, request) = link.expect_request().await;
        let Request::CallModuleExport { mut args, .. } = request else {
            panic!("expected callModuleExport, got {request:?}");
        };
        received.push((id, args.remove(0)));
    }
    // Answer in reverse order; correlation must still route each response to
    // its own caller.
    for (id, echo) in received.into_iter().rev() {
        link.respond(id, echo).await;
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let value = within(handle)
            .await
            .context("join")?
            .with_context(|| format!("call {i}"))?;
        assert_eq!(value, Value::Int(i64::try_from(i)?));
    }
    Ok(())
}

#[tokio::test]
async fn dropping_the_processor_terminates_the_sandbox() -> Result<()> {
    let (transport, mut links) = common::transport();
    let processor = Processor::builder().build(transport);

    let (result, mut link) = within(async {
        tokio::join!(processor.activate(), async {
            let link = expect_link(&mut links).await;
            link.initialized().await;
            link
        })
    })
    .await;
    result.context("activation")?;

    drop(processor);
    assert_eq!(link.recv().await, Envelope::Terminate);
    Ok(())
}
