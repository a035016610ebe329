//! Message channel between the processor and its isolated context.
//!
//! The controller is agnostic to the isolation primitive: anything offering
//! ordered, asynchronous delivery of [`Envelope`]s between an untrusted unit
//! and the host satisfies [`Transport`]. The binding shipped here runs the
//! sandbox runtime as a subprocess and frames CBOR envelopes over its stdio;
//! tests bind in-process channels instead.

use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use bytes::Bytes;
use enclave_wire::Envelope;
use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::value::BoxError;

/// A message arriving from the sandbox side. Decode failures are delivered
/// in-band so the controller can treat them as protocol corruption, distinct
/// from the channel simply closing.
pub type InboundItem = core::result::Result<Envelope, BoxError>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Spawn the isolated context and bind it to the given channels.
    ///
    /// The implementation must forward every envelope from `outbound` in
    /// order, deliver sandbox messages to `inbound`, and release the context
    /// once either channel closes. The returned task owns the context; the
    /// controller never aborts it, it closes the channels and lets the task
    /// wind down.
    ///
    /// # Errors
    /// Returns an error if the isolated context cannot be spawned.
    async fn connect(
        &self,
        outbound: mpsc::UnboundedReceiver<Envelope>,
        inbound: mpsc::Sender<InboundItem>,
    ) -> core::result::Result<JoinHandle<core::result::Result<(), BoxError>>, BoxError>;
}

/// Transport running the sandbox runtime as a subprocess with piped stdio.
///
/// Envelopes are CBOR-encoded and length-delimited in both directions. The
/// child inherits nothing beyond its arguments and is killed when the link
/// is torn down or the pump task is dropped.
#[derive(Debug, Clone)]
pub struct CommandTransport {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandTransport {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl Transport for CommandTransport {
    async fn connect(
        &self,
        mut outbound: mpsc::UnboundedReceiver<Envelope>,
        inbound: mpsc::Sender<InboundItem>,
    ) -> core::result::Result<JoinHandle<core::result::Result<(), BoxError>>, BoxError> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| -> BoxError { Box::new(error) })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| -> BoxError { "sandbox child has no stdin".into() })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| -> BoxError { "sandbox child has no stdout".into() })?;

        Ok(tokio::spawn(async move {
            let mut writer = FramedWrite::new(stdin, LengthDelimitedCodec::new());
            let mut reader = FramedRead::new(stdout, LengthDelimitedCodec::new());
            let result = async {
                loop {
                    tokio::select! {
                        envelope = outbound.recv() => match envelope {
                            Some(envelope) => {
                                let frame = enclave_wire::to_cbor(&envelope)
                                    .map_err(|error| -> BoxError { Box::new(error) })?;
                                writer
                                    .send(Bytes::from(frame))
                                    .await
                                    .map_err(|error| -> BoxError { Box::new(error) })?;
                            }
                            // Link torn down; any buffered terminate has
                            // already been written.
                            None => break,
                        },
                        frame = reader.next() => match frame {
                            Some(Ok(frame)) => {
                                let item = enclave_wire::from_cbor(&frame)
                                    .map_err(|error| -> BoxError { Box::new(error) });
                                if inbound.send(item).await.is_err() {
                                    break;
                                }
                            }
                            Some(Err(error)) => {
                                let _ = inbound.send(Err(Box::new(error))).await;
                                break;
                            }
                            // Child exited.
                            None => break,
                        },
                    }
                }
                Ok::<(), BoxError>(())
            }
            .await;
            let _ = child.kill().await;
            result
        }))
    }
}

/// Transport that never connects; placeholder for driver unit tests.
#[cfg(test)]
pub(crate) struct NullTransport;

#[cfg(test)]
#[async_trait]
impl Transport for NullTransport {
    async fn connect(
        &self,
        _outbound: mpsc::UnboundedReceiver<Envelope>,
        _inbound: mpsc::Sender<InboundItem>,
    ) -> core::result::Result<JoinHandle<core::result::Result<(), BoxError>>, BoxError> {
        Err("no sandbox available".into())
    }
}
