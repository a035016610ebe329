//! Harness binding a processor to a scripted in-process sandbox.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use enclave::{
    BoxError, InboundItem, ResetReason, Transport,
    wire::{Envelope, Request, RequestId, WireValue},
};
use tokio::{sync::mpsc, task::JoinHandle};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Guard against a hung test when a settlement or envelope never arrives.
pub(crate) async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("test timed out")
}

/// Transport handing each connection's channel pair to the test, which then
/// plays the sandbox side by hand.
pub(crate) struct ScriptedTransport {
    links: mpsc::UnboundedSender<SandboxLink>,
}

pub(crate) fn transport() -> (ScriptedTransport, mpsc::UnboundedReceiver<SandboxLink>) {
    let (links, link_rx) = mpsc::unbounded_channel();
    (ScriptedTransport { links }, link_rx)
}

pub(crate) async fn expect_link(links: &mut mpsc::UnboundedReceiver<SandboxLink>) -> SandboxLink {
    within(links.recv()).await.expect("no sandbox was spawned")
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(
        &self,
        outbound: mpsc::UnboundedReceiver<Envelope>,
        inbound: mpsc::Sender<InboundItem>,
    ) -> Result<JoinHandle<Result<(), BoxError>>, BoxError> {
        self.links
            .send(SandboxLink {
                from_host: outbound,
                to_host: inbound,
            })
            .map_err(|_| -> BoxError { "test dropped the link receiver".into() })?;
        Ok(tokio::spawn(async { Ok(()) }))
    }
}

/// The sandbox end of one connection.
pub(crate) struct SandboxLink {
    from_host: mpsc::UnboundedReceiver<Envelope>,
    to_host: mpsc::Sender<InboundItem>,
}

impl SandboxLink {
    pub(crate) async fn recv(&mut self) -> Envelope {
        within(self.from_host.recv())
            .await
            .expect("host closed the link")
    }

    pub(crate) async fn send(&self, envelope: Envelope) {
        self.to_host
            .send(Ok(envelope))
            .await
            .expect("processor stopped listening");
    }

    pub(crate) async fn initialized(&self) {
        self.send(Envelope::Initialized).await;
    }

    /// Expect the next host envelope to be a request.
    pub(crate) async fn expect_request(&mut self) -> (RequestId, Request) {
        match self.recv().await {
            Envelope::Request { id, request } => (id, request),
            other => panic!("expected request envelope, got {other:?}"),
        }
    }

    pub(crate) async fn respond(&self, id: RequestId, response: WireValue) {
        self.send(Envelope::Respond {
            id,
            response: Some(response),
            error: None,
        })
        .await;
    }

    pub(crate) async fn respond_empty(&self, id: RequestId) {
        self.send(Envelope::Respond {
            id,
            response: None,
            error: None,
        })
        .await;
    }

    pub(crate) async fn respond_error(&self, id: RequestId, error: WireValue) {
        self.send(Envelope::Respond {
            id,
            response: None,
            error: Some(error),
        })
        .await;
    }
}

/// Records every reset reason delivered to the on-reset hook.
pub(crate) fn reset_probe() -> (
    Arc<Mutex<Vec<ResetReason>>>,
    impl Fn(&ResetReason) + Send + Sync + 'static,
) {
    let reasons: Arc<Mutex<Vec<ResetReason>>> = Arc::default();
    let probe = Arc::clone(&reasons);
    (reasons, move |reason: &ResetReason| {
        probe.lock().expect("probe lock").push(reason.clone());
    })
}
