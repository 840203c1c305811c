//! Channel protocol between the run core and a front end.
//!
//! The core pushes coalesced [`RunEvent`]s out and reads [`RunInput`]s
//! at well-defined suspension points. Every consumed input is answered
//! with an [`RunEvent::InputAck`] so the front end knows when it is
//! safe to send the next message.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::scheduler::StatusReport;

/// Depth of both directions of the link.
pub const CHANNEL_CAPACITY: usize = 8;

/// Messages a front end sends into the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RunInput {
    /// Login code typed by the operator.
    Code(String),
    /// Ask Telegram to send a fresh login code.
    Resend,
    /// Give up on the current prompt.
    Skip,
    /// Chat id picked from a `SelectGroup` prompt.
    GroupSelection(i64),
    /// New per-account invite ceiling.
    Limit(u32),
}

/// Events the core pushes to the front end.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Status { report: StatusReport },
    Prompt { prompt: Prompt },
    /// The last input was consumed.
    InputAck,
    Finished { report: StatusReport },
}

/// A question the core needs answered before it can continue.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Prompt {
    LoginCode { account: String },
    SelectGroup { options: Vec<GroupOption> },
    InviteLimit { current: u32, max: u32 },
}

/// One selectable chat in a `SelectGroup` prompt.
#[derive(Debug, Clone, Serialize)]
pub struct GroupOption {
    pub chat_id: i64,
    pub title: String,
    pub member_count: Option<i64>,
}

/// Reply to a login-code prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeReply {
    Code(String),
    Resend,
    Skip,
}

/// Core side of the link. Cheap to share behind an `Arc`; concurrent
/// prompts from different workers are served one at a time.
#[derive(Debug)]
pub struct FrontendLink {
    events: mpsc::Sender<RunEvent>,
    inputs: Mutex<mpsc::Receiver<RunInput>>,
}

/// Front-end side of the link.
#[derive(Debug)]
pub struct FrontendHandle {
    events: mpsc::Receiver<RunEvent>,
    inputs: mpsc::Sender<RunInput>,
}

/// Creates a connected core/front-end pair.
#[must_use]
pub fn link() -> (FrontendLink, FrontendHandle) {
    let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (inputs_tx, inputs_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        FrontendLink {
            events: events_tx,
            inputs: Mutex::new(inputs_rx),
        },
        FrontendHandle {
            events: events_rx,
            inputs: inputs_tx,
        },
    )
}

impl FrontendLink {
    /// Pushes a status snapshot without blocking. When the front end
    /// lags, stale snapshots are dropped; the next tick supersedes them.
    pub fn push_status(&self, report: StatusReport) {
        match self.events.try_send(RunEvent::Status { report }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("front end lagging, dropped a status update");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Delivers the final report. A closed front end is not an error.
    pub async fn finished(&self, report: StatusReport) {
        let _ = self.events.send(RunEvent::Finished { report }).await;
    }

    /// Asks for a login code and waits for the reply. Only the calling
    /// worker suspends. A disconnected front end reads as `Skip`.
    pub async fn request_login_code(&self, account: &str) -> CodeReply {
        let mut inputs = self.inputs.lock().await;
        let prompt = Prompt::LoginCode {
            account: account.to_string(),
        };
        if self.send_prompt(prompt).await.is_err() {
            return CodeReply::Skip;
        }
        loop {
            let Some(input) = inputs.recv().await else {
                return CodeReply::Skip;
            };
            let reply = match input {
                RunInput::Code(code) => Some(CodeReply::Code(code)),
                RunInput::Resend => Some(CodeReply::Resend),
                RunInput::Skip => Some(CodeReply::Skip),
                other => {
                    warn!(input = ?other, "ignoring input that is not a login reply");
                    None
                }
            };
            self.ack().await;
            if let Some(reply) = reply {
                return reply;
            }
        }
    }

    /// Offers candidate target groups and waits for a selection.
    /// Returns `None` when the operator skips or the front end is gone.
    pub async fn select_group(&self, options: Vec<GroupOption>) -> Option<i64> {
        let mut inputs = self.inputs.lock().await;
        let valid: Vec<i64> = options.iter().map(|option| option.chat_id).collect();
        if self.send_prompt(Prompt::SelectGroup { options }).await.is_err() {
            return None;
        }
        loop {
            let input = inputs.recv().await?;
            let choice = match input {
                RunInput::GroupSelection(chat_id) if valid.contains(&chat_id) => {
                    Some(Some(chat_id))
                }
                RunInput::GroupSelection(chat_id) => {
                    warn!(chat_id, "selection does not match any offered group");
                    None
                }
                RunInput::Skip => Some(None),
                other => {
                    warn!(input = ?other, "ignoring input that is not a group selection");
                    None
                }
            };
            self.ack().await;
            if let Some(choice) = choice {
                return choice;
            }
        }
    }

    /// Asks for a new invite ceiling. Returns `None` on skip.
    pub async fn request_limit(&self, current: u32, max: u32) -> Option<u32> {
        let mut inputs = self.inputs.lock().await;
        if self
            .send_prompt(Prompt::InviteLimit { current, max })
            .await
            .is_err()
        {
            return None;
        }
        loop {
            let input = inputs.recv().await?;
            let choice = match input {
                RunInput::Limit(n) => Some(Some(n)),
                RunInput::Skip => Some(None),
                other => {
                    warn!(input = ?other, "ignoring input that is not a limit");
                    None
                }
            };
            self.ack().await;
            if let Some(choice) = choice {
                return choice;
            }
        }
    }

    async fn send_prompt(&self, prompt: Prompt) -> Result<(), mpsc::error::SendError<RunEvent>> {
        self.events.send(RunEvent::Prompt { prompt }).await
    }

    async fn ack(&self) {
        let _ = self.events.send(RunEvent::InputAck).await;
    }
}

impl FrontendHandle {
    /// Next event from the core; `None` once the run has shut down.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }

    /// Sends an input to the core. Returns `false` when the run is gone.
    pub async fn send(&self, input: RunInput) -> bool {
        self.inputs.send(input).await.is_ok()
    }
}
