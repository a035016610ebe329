//! Host-facing surface of the extension processor.
//!
//! Typical flow:
//! 1. Configure hooks on a [`ProcessorBuilder`] and [`build`](ProcessorBuilder::build)
//!    it with a [`Transport`].
//! 2. Issue typed calls ([`Processor::call_module_export`] and friends); the
//!    first one lazily boots the sandbox, earlier callers are queued and
//!    flushed once it is running.
//! 3. The initialize hook receives an [`InitScope`] whose requests are
//!    delivered during bootstrap, before the sandbox is declared available.

use std::sync::Arc;

use base64::Engine as _;
use futures::{FutureExt as _, future::BoxFuture};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    driver::{CallRequest, Command, Driver, SendMode},
    error::{Error, ResetReason, Result},
    transport::Transport,
    value::{BoxError, Value},
};

pub(crate) type InitHook =
    dyn Fn(InitScope) -> BoxFuture<'static, core::result::Result<(), BoxError>> + Send + Sync;
pub(crate) type ResetHook = dyn Fn(&ResetReason) + Send + Sync;

/// Controller for one sandboxed extension bundle.
///
/// Owns exactly one isolated context, created lazily on first use and torn
/// down on [`reset`](Self::reset), [`shutdown`](Self::shutdown) or drop. All
/// methods are cheap fronts over a command channel to the driver task, so a
/// `Processor` can be shared behind an `Arc` by the embedding application.
pub struct Processor {
    commands: mpsc::UnboundedSender<Command>,
    driver: Option<JoinHandle<()>>,
}

impl Processor {
    #[must_use]
    pub fn builder() -> ProcessorBuilder {
        ProcessorBuilder::new()
    }

    /// Resolve once the sandbox reaches the running state, booting it if
    /// necessary. Useful for warming up an extension before it is needed.
    ///
    /// # Errors
    /// Returns an error if the sandbox fails to start.
    pub async fn activate(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Activate { reply })
            .map_err(|_| Error::Closed)?;
        response.await.map_err(|_| Error::Closed)?
    }

    /// Load additional code into the sandbox by URL.
    ///
    /// # Errors
    /// Returns an error if the sandbox reports a load failure or resets.
    pub async fn import_scripts<I, S>(&self, urls: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        dispatch(&self.commands, SendMode::Ready, import_scripts(urls))
            .await
            .map(|_| ())
    }

    /// Load literal source text into the sandbox.
    ///
    /// # Errors
    /// Returns an error if the sandbox reports a load failure or resets.
    pub async fn import_source(&self, source: &str) -> Result<()> {
        dispatch(&self.commands, SendMode::Ready, import_source(source))
            .await
            .map(|_| ())
    }

    /// Read a named export of a loaded module.
    ///
    /// # Errors
    /// Returns an error if the module or export is missing, or on reset.
    pub async fn get_module_export(&self, module_id: &str, export_name: &str) -> Result<Value> {
        dispatch(
            &self.commands,
            SendMode::Ready,
            get_module_export(module_id, export_name),
        )
        .await
    }

    /// Invoke a named export of a loaded module. Arguments may contain
    /// callables; the sandbox can invoke those at any time until the next
    /// reset.
    ///
    /// # Errors
    /// Returns an error if the sandbox reports a call failure or resets.
    pub async fn call_module_export(
        &self,
        module_id: &str,
        export_name: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        dispatch(
            &self.commands,
            SendMode::Ready,
            call_module_export(module_id, export_name, args),
        )
        .await
    }

    /// Tear the sandbox down and return to the initial state, rejecting
    /// every outstanding call. The processor stays usable: the next call
    /// boots a fresh sandbox.
    ///
    /// # Errors
    /// Returns an error if the driver is already gone.
    pub async fn reset(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Reset { reply })
            .map_err(|_| Error::Closed)?;
        response.await.map_err(|_| Error::Closed)
    }

    /// Tear the sandbox down and stop the driver task.
    pub async fn shutdown(mut self) {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { reply: Some(reply) })
            .is_ok()
        {
            let _ = response.await;
        }
        if let Some(task) = self.driver.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        if self.driver.is_some() {
            let _ = self.commands.send(Command::Shutdown { reply: None });
        }
    }
}

/// Bootstrap handle passed to the initialize hook.
///
/// Requests issued through it are delivered immediately, while the sandbox
/// is initializing but not yet generally available. Using it outside the
/// initialize phase fails fast with [`Error::NotInitializing`].
#[derive(Clone)]
pub struct InitScope {
    commands: mpsc::UnboundedSender<Command>,
}

impl InitScope {
    pub(crate) const fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { commands }
    }

    /// Load additional code into the sandbox by URL during bootstrap.
    ///
    /// # Errors
    /// Returns an error if the sandbox reports a load failure or resets.
    pub async fn import_scripts<I, S>(&self, urls: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        dispatch(&self.commands, SendMode::Bootstrap, import_scripts(urls))
            .await
            .map(|_| ())
    }

    /// Load literal source text into the sandbox during bootstrap.
    ///
    /// # Errors
    /// Returns an error if the sandbox reports a load failure or resets.
    pub async fn import_source(&self, source: &str) -> Result<()> {
        dispatch(&self.commands, SendMode::Bootstrap, import_source(source))
            .await
            .map(|_| ())
    }

    /// Read a named export of a loaded module during bootstrap.
    ///
    /// # Errors
    /// Returns an error if the module or export is missing, or on reset.
    pub async fn get_module_export(&self, module_id: &str, export_name: &str) -> Result<Value> {
        dispatch(
            &self.commands,
            SendMode::Bootstrap,
            get_module_export(module_id, export_name),
        )
        .await
    }

    /// Invoke a named export of a loaded module during bootstrap.
    ///
    /// # Errors
    /// Returns an error if the sandbox reports a call failure or resets.
    pub async fn call_module_export(
        &self,
        module_id: &str,
        export_name: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        dispatch(
            &self.commands,
            SendMode::Bootstrap,
            call_module_export(module_id, export_name, args),
        )
        .await
    }
}

async fn dispatch(
    commands: &mpsc::UnboundedSender<Command>,
    mode: SendMode,
    request: CallRequest,
) -> Result<Value> {
    let (reply, response) = oneshot::channel();
    commands
        .send(Command::Call {
            mode,
            request,
            reply,
        })
        .map_err(|_| Error::Closed)?;
    response.await.map_err(|_| Error::Closed)?
}

fn import_scripts<I, S>(urls: I) -> CallRequest
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    CallRequest::ImportScripts {
        urls: urls.into_iter().map(Into::into).collect(),
    }
}

fn import_source(source: &str) -> CallRequest {
    CallRequest::ImportScripts {
        urls: vec![source_data_url(source)],
    }
}

fn get_module_export(module_id: &str, export_name: &str) -> CallRequest {
    CallRequest::GetModuleExport {
        module_id: module_id.to_string(),
        export_name: export_name.to_string(),
    }
}

fn call_module_export(module_id: &str, export_name: &str, args: Vec<Value>) -> CallRequest {
    CallRequest::CallModuleExport {
        module_id: module_id.to_string(),
        export_name: export_name.to_string(),
        args,
    }
}

/// Literal source is shipped as a data URL through the ordinary script
/// import path, so the sandbox runtime needs no separate operation for it.
fn source_data_url(source: &str) -> String {
    format!(
        "data:text/javascript;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(source)
    )
}

/// Configuration for a [`Processor`].
#[derive(Default)]
pub struct ProcessorBuilder {
    on_initialize: Option<Arc<InitHook>>,
    on_reset: Option<Arc<ResetHook>>,
}

impl ProcessorBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hook run between the sandbox signalling ready and the processor
    /// declaring it generally available. Bootstrap requests issued through
    /// the given [`InitScope`] are delivered immediately; a failure resets
    /// the sandbox and rejects everything queued for it.
    #[must_use]
    pub fn on_initialize<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(InitScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = core::result::Result<(), BoxError>> + Send + 'static,
    {
        self.on_initialize = Some(Arc::new(move |scope| hook(scope).boxed()));
        self
    }

    /// Hook observing every reset, with the reason that was delivered to the
    /// rejected callers. Runs after all teardown and settlement.
    #[must_use]
    pub fn on_reset<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ResetReason) + Send + Sync + 'static,
    {
        self.on_reset = Some(Arc::new(hook));
        self
    }

    /// Spawn the driver task and return the handle. The sandbox itself is
    /// not started until the first call needs it.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn build(self, transport: impl Transport) -> Processor {
        let (commands, task) = Driver::spawn(Arc::new(transport), self.on_initialize, self.on_reset);
        Processor {
            commands,
            driver: Some(task),
        }
    }
}
