use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use async_trait::async_trait;
use http::Method;
use isobridge::{
    BoxError, ConsoleLevel, ConsoleSink, Error, HostConfig, Launcher, LocalLauncher, Marshalling,
    OfflineHost, SandboxConfig, SandboxedExecutionHost, Scope, Script, SessionConfig,
    SessionState, TRACE_TARGET_SCRIPT, Transport, Value,
    dom::{Node, Rect},
    value::{Function, Object},
};
use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing_subscriber::{
    Layer, Registry,
    layer::{Context, SubscriberExt},
};

use crate::common::{self, FakeHost};

fn globals() -> Value {
    Value::Object(Object::new())
}

#[tokio::test]
async fn evaluates_and_reuses_session() -> Result<()> {
    let launcher = common::launcher();
    let host = SandboxedExecutionHost::new(OfflineHost, launcher.clone(), HostConfig::default());
    assert_eq!(host.state(), SessionState::Uninitialized);

    let result = host
        .exec_script_isolated("return 1+1", &globals(), None, None)
        .await?;
    assert_eq!(result, Value::Number(2.0));
    assert_eq!(host.state(), SessionState::Ready);

    let result = host
        .exec_script_isolated("return 2+3+4", &globals(), Some(1), None)
        .await?;
    assert_eq!(result, Value::Number(9.0));
    assert_eq!(launcher.launches(), 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_callers_share_establishment() -> Result<()> {
    let launcher = common::launcher();
    let host = SandboxedExecutionHost::new(OfflineHost, launcher.clone(), HostConfig::default());
    let g = globals();
    let (a, b, c) = tokio::join!(
        host.exec_script_isolated("return 1", &g, None, None),
        host.exec_script_isolated("return 2", &g, None, None),
        host.exec_script_isolated("return 3", &g, None, None),
    );
    assert_eq!(
        (a?, b?, c?),
        (Value::Number(1.0), Value::Number(2.0), Value::Number(3.0))
    );
    assert_eq!(launcher.launches(), 1);
    Ok(())
}

/// Never answers the first launch; later launches start a real sandbox.
struct SilentFirst {
    attempts: AtomicUsize,
    held: Mutex<Vec<Transport>>,
    fallback: LocalLauncher,
}

#[async_trait]
impl Launcher for SilentFirst {
    async fn launch(&self, origin: &str) -> Result<Transport, BoxError> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            let (host_end, sandbox_end) = Transport::pair();
            self.held.lock().push(sandbox_end);
            return Ok(host_end);
        }
        self.fallback.launch(origin).await
    }
}

#[tokio::test(start_paused = true)]
async fn handshake_timeout_discards_session() -> Result<()> {
    let launcher = Arc::new(SilentFirst {
        attempts: AtomicUsize::new(0),
        held: Mutex::new(Vec::new()),
        fallback: common::launcher(),
    });
    let config = HostConfig::default()
        .session(SessionConfig::default().handshake_deadline(Duration::from_secs(2)));
    let host = SandboxedExecutionHost::new(OfflineHost, launcher.clone(), config);

    let err = host
        .exec_script_isolated("return 1", &globals(), None, None)
        .await
        .err();
    assert!(err.as_ref().is_some_and(Error::is_timeout), "{err:?}");
    assert_eq!(host.state(), SessionState::TornDown);

    let result = host
        .exec_script_isolated("return 1+1", &globals(), None, None)
        .await?;
    assert_eq!(result, Value::Number(2.0));
    assert_eq!(launcher.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(host.state(), SessionState::Ready);
    Ok(())
}

#[tokio::test]
async fn script_errors_are_reconstructed() -> Result<()> {
    let host = SandboxedExecutionHost::new(OfflineHost, common::launcher(), HostConfig::default());
    let err = host
        .exec_script_isolated("throw bad input", &globals(), None, None)
        .await;
    let Err(Error::Eval { error }) = err else {
        bail!("expected an eval error, got {err:?}");
    };
    let error = error.as_error().cloned();
    assert_eq!(error.as_ref().map(|e| e.name.as_str()), Some("TypeError"));
    assert_eq!(error.as_ref().map(|e| e.message.as_str()), Some("bad input"));
    Ok(())
}

#[tokio::test]
async fn console_goes_to_caller_sink() -> Result<()> {
    let host = SandboxedExecutionHost::new(OfflineHost, common::launcher(), HostConfig::default());
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let lines = lines.clone();
        move |level: ConsoleLevel, args: &[Value]| {
            let text = args.iter().map(Value::describe).collect::<Vec<_>>().join(" ");
            lines.lock().push((level, text));
        }
    };
    let sink: Arc<dyn ConsoleSink> = Arc::new(sink);
    host.exec_script_isolated("log hello world", &globals(), None, Some(sink))
        .await?;
    assert_eq!(
        *lines.lock(),
        vec![
            (ConsoleLevel::Log, "hello world".to_string()),
            (ConsoleLevel::Warn, "done".to_string()),
        ]
    );
    Ok(())
}

#[derive(Clone, Default)]
struct ScriptEvents(Arc<Mutex<Vec<(tracing::Level, String)>>>);

impl<S: tracing::Subscriber> Layer<S> for ScriptEvents {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if meta.target() != TRACE_TARGET_SCRIPT {
            return;
        }
        let mut message = MessageField::default();
        event.record(&mut message);
        self.0.lock().push((*meta.level(), message.0));
    }
}

#[derive(Default)]
struct MessageField(String);

impl Visit for MessageField {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

#[tokio::test]
async fn unclaimed_console_is_traced() -> Result<()> {
    let events = ScriptEvents::default();
    let _guard = tracing::subscriber::set_default(Registry::default().with(events.clone()));

    let host = SandboxedExecutionHost::new(OfflineHost, common::launcher(), HostConfig::default());
    host.exec_script_isolated("log hello world", &globals(), None, None)
        .await?;
    assert_eq!(
        *events.0.lock(),
        vec![
            (tracing::Level::INFO, "hello world".to_string()),
            (tracing::Level::WARN, "done".to_string()),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn scripts_call_host_functions() -> Result<()> {
    let host = SandboxedExecutionHost::new(OfflineHost, common::launcher(), HostConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let add = {
        let calls = calls.clone();
        Function::from_sync("add", move |_, args| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Number(args.iter().filter_map(Value::as_f64).sum()))
        })
    };
    let globals = Value::Object(Object::from_entries([("add", add)]));

    let result = host
        .exec_script_isolated("call add 2 3", &globals, None, None)
        .await?;
    assert_eq!(result, Value::Number(5.0));
    let result = host
        .exec_script_isolated("call add 10 20", &globals, None, None)
        .await?;
    assert_eq!(result, Value::Number(30.0));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn raw_marshalling_rejects_capabilities() -> Result<()> {
    let config = HostConfig::default().marshalling(Marshalling::Raw);
    let host = SandboxedExecutionHost::new(OfflineHost, common::launcher(), config);

    let plain = Value::Object(Object::from_entries([("n", Value::from(1)), ("s", Value::from("x"))]));
    let echoed = host
        .exec_script_isolated("globals", &plain, None, None)
        .await?;
    assert!(echoed.deep_eq(&plain));

    let with_fn = Value::Object(Object::from_entries([(
        "f",
        Value::from(Function::from_sync("f", |_, _| Ok(Value::Undefined))),
    )]));
    let err = host
        .exec_script_isolated("globals", &with_fn, None, None)
        .await;
    assert!(matches!(err, Err(Error::DataClone { .. })), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn fetch_is_forwarded_to_host() -> Result<()> {
    let fake = FakeHost::default().route("https://api.test/data", 200, "hello");
    let host = SandboxedExecutionHost::new(fake.clone(), common::launcher(), HostConfig::default());

    let result = host
        .exec_script_isolated("fetch https://api.test/data", &globals(), None, None)
        .await?;
    let result = result.as_object().cloned();
    assert_eq!(result.as_ref().map(|o| o.get("status")), Some(Value::Number(200.0)));
    assert_eq!(result.as_ref().map(|o| o.get("body")), Some(Value::from("hello")));
    {
        let requests = fake.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::GET);
    }

    let err = host
        .exec_script_isolated("fetch https://api.test/missing", &globals(), None, None)
        .await;
    let Err(Error::Eval { error }) = err else {
        bail!("expected fetch failure, got {err:?}");
    };
    assert!(error.describe().contains("fetch failed"));
    Ok(())
}

#[tokio::test]
async fn websockets_are_forwarded() -> Result<()> {
    let host = SandboxedExecutionHost::new(
        FakeHost::default(),
        common::launcher(),
        HostConfig::default(),
    );
    let reply = host
        .exec_script_isolated("echo wss://echo.test hi", &globals(), None, None)
        .await?;
    assert_eq!(reply, Value::from("echo: hi"));
    Ok(())
}

#[tokio::test]
async fn shutdown_rejects_outstanding_evals() -> Result<()> {
    let launcher = common::launcher();
    let host = SandboxedExecutionHost::new(OfflineHost, launcher.clone(), HostConfig::default());
    host.exec_script_isolated("return 0", &globals(), None, None)
        .await?;

    let pending = {
        let host = host.clone();
        tokio::spawn(async move {
            host.exec_script_isolated("hang", &Value::Undefined, None, None)
                .await
        })
    };
    common::settle().await;
    host.shutdown();
    assert!(matches!(pending.await?, Err(Error::ChannelClosed)));
    assert_eq!(host.state(), SessionState::TornDown);

    host.exec_script_isolated("return 0", &globals(), None, None)
        .await?;
    assert_eq!(launcher.launches(), 2);
    Ok(())
}

#[tokio::test]
async fn presents_sandbox_nodes() -> Result<()> {
    let node = Node::element("canvas");
    node.set_bounds(Rect::new(4.0, 8.0, 300.0, 150.0));
    let engine = {
        let node = node.clone();
        move |_: Script, _: Scope| {
            let node = node.clone();
            async move { Ok::<_, Value>(Value::from(node)) }
        }
    };
    let launcher = LocalLauncher::new(engine, SandboxConfig::default());
    let host = SandboxedExecutionHost::new(OfflineHost, launcher, HostConfig::default());

    let Value::RemoteNode(remote) = host
        .exec_script_isolated("", &globals(), None, None)
        .await?
    else {
        bail!("expected a remote node");
    };
    assert_eq!(remote.tag_name.as_deref(), Some("canvas"));

    let bounds = host.present_visual(&remote.handle, "cell-7").await?;
    assert_eq!(bounds, Some(Rect::new(4.0, 8.0, 300.0, 150.0)));
    assert_eq!(
        node.parent().and_then(|p| p.attribute("data-context")),
        Some("cell-7".to_string())
    );
    assert_eq!(host.present_visual("nope", "cell-7").await?, None);
    Ok(())
}
