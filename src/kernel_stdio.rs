//! Purpose: Run the kernel over a newline-delimited JSON stdio transport.
//! Exports: `serve`, `serve_io`, `LineChannel`.
//! Role: Bridge request envelopes on stdin to the dispatcher; frame replies and output on stdout.
//! Invariants: stdout only carries JSON lines of the form `{"channel": ..., "msg": envelope}`.
//! Invariants: Output-channel messages for a request are written before its reply.
//! Invariants: stdin EOF or a shutdown request exits cleanly; fatal errors propagate.
use std::io::{self, BufRead, Write};

use serde_json::{Value, json};

use crate::core::channel::{OutputMessage, Publisher};
use crate::core::error::{Error, ErrorKind};
use crate::protocol::{
    DispatchOutcome, Envelope, Header, KernelDispatcher, KernelHandler, ProtocolError,
    parse_envelope_line,
};

pub const SHELL_CHANNEL: &str = "shell";
pub const IOPUB_CHANNEL: &str = "iopub";

pub fn serve<H: KernelHandler>(dispatcher: &mut KernelDispatcher<H>) -> Result<(), Error> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve_io(stdin.lock(), stdout.lock(), dispatcher)
}

pub fn serve_io<R, W, H>(
    mut reader: R,
    writer: W,
    dispatcher: &mut KernelDispatcher<H>,
) -> Result<(), Error>
where
    R: BufRead,
    W: Write,
    H: KernelHandler,
{
    let mut channel = LineChannel::new(writer);
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader.read_line(&mut line).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read kernel request")
                .with_source(err)
        })?;
        if read == 0 {
            tracing::info!("stdin closed; stopping kernel");
            return channel.flush();
        }

        let message = line.trim_end_matches(['\n', '\r']);
        if message.is_empty() {
            continue;
        }

        let request = match parse_envelope_line(message) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::warn!(error = %error.message, "dropping unparseable request line");
                channel.write_protocol_error(&error)?;
                continue;
            }
        };

        channel.set_parent(request.header.clone());
        let outcome = dispatcher.dispatch(&request, &mut channel).inspect_err(|err| {
            tracing::error!(error = %err, "fatal kernel error");
        })?;
        match outcome {
            DispatchOutcome::NoReply => {}
            DispatchOutcome::Reply { msg_type, content } => {
                channel.write_reply(&msg_type, content)?;
            }
            DispatchOutcome::Shutdown { msg_type, content } => {
                channel.write_reply(&msg_type, content)?;
                return channel.flush();
            }
        }
    }
}

/// Frames envelopes as JSON lines; publishes output parented to the current request.
pub struct LineChannel<W> {
    writer: W,
    parent: Option<Header>,
}

impl<W: Write> LineChannel<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            parent: None,
        }
    }

    pub fn set_parent(&mut self, parent: Header) {
        self.parent = Some(parent);
    }

    pub fn write_reply(&mut self, msg_type: &str, content: Value) -> Result<(), Error> {
        let envelope = Envelope::new(msg_type, self.parent.as_ref(), content)?;
        self.write_envelope(SHELL_CHANNEL, &envelope)
    }

    fn write_protocol_error(&mut self, error: &ProtocolError) -> Result<(), Error> {
        let payload = json!({
            "channel": SHELL_CHANNEL,
            "error": { "message": error.message },
        });
        self.write_json_line(&payload)
    }

    fn write_envelope(&mut self, channel: &str, envelope: &Envelope) -> Result<(), Error> {
        let msg = serde_json::to_value(envelope).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode kernel message")
                .with_source(err)
        })?;
        self.write_json_line(&json!({ "channel": channel, "msg": msg }))
    }

    fn write_json_line(&mut self, payload: &Value) -> Result<(), Error> {
        serde_json::to_writer(&mut self.writer, payload).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode kernel message")
                .with_source(err)
        })?;
        self.writer.write_all(b"\n").map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write kernel message")
                .with_source(err)
        })?;
        self.flush()
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to flush kernel output")
                .with_source(err)
        })
    }
}

impl<W: Write> Publisher for LineChannel<W> {
    fn publish(&mut self, message: OutputMessage) -> Result<(), Error> {
        let envelope = Envelope::new(message.msg_type(), self.parent.as_ref(), message.content())?;
        self.write_envelope(IOPUB_CHANNEL, &envelope)
    }
}
