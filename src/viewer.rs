//! Viewer session protocol.
//!
//! A [`ViewerSession`] is the state behind one live viewer connection,
//! independent of the transport carrying it. Requests arrive as JSON text
//! `{"action": ..., "data": ...}`; everything the session wants to send
//! back (events and a possible close) is queued on an mpsc channel the
//! transport drains.

use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::HubError;
use crate::ids::SimulationId;
use crate::manager::{InstanceManager, SimulationHeader};
use crate::subscription::{Notification, Subscriber};

/// Close code sent when a viewer connects to an unknown simulation.
pub const CLOSE_UNKNOWN_SIMULATION: u16 = 4101;

/// Request sent by a viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerRequest {
    /// Follow the given simulation.
    ConnectTo(SimulationId),
    /// Resend the header of the followed simulation.
    GetHeader,
    /// Stop the followed simulation.
    Stop,
    /// Reload the followed simulation, relaunching it if offline.
    Reload,
}

#[derive(Deserialize)]
struct RawRequest {
    action: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl FromStr for ViewerRequest {
    type Err = HubError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let raw: RawRequest = serde_json::from_str(text)?;
        match raw.action.as_str() {
            "connectto" => {
                let id = raw
                    .data
                    .as_str()
                    .ok_or_else(|| {
                        HubError::Codec("connectto expects an id string".into())
                    })?
                    .parse()
                    .map_err(|e| HubError::Codec(format!("bad id: {e}")))?;
                Ok(Self::ConnectTo(id))
            }
            "getheader" => Ok(Self::GetHeader),
            "stop" => Ok(Self::Stop),
            "reload" => Ok(Self::Reload),
            other => Err(HubError::Codec(format!("unknown action '{other}'"))),
        }
    }
}

/// Event sent to a viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "data")]
pub enum ViewerEvent {
    /// Simulation summary.
    #[serde(rename = "simheader")]
    Header(SimulationHeader),
    /// Frame count changed.
    #[serde(rename = "newframe")]
    NewFrame {
        /// Number of committed frames.
        #[serde(rename = "frameCount")]
        frame_count: u64,
    },
    /// Shape list changed.
    #[serde(rename = "newshape")]
    NewShape,
    /// The worker reported a fatal error.
    #[serde(rename = "error_message")]
    ErrorMessage(String),
    /// The simulation stopped.
    #[serde(rename = "simstopped")]
    SimStopped,
}

impl ViewerEvent {
    /// JSON text of the event.
    pub fn to_text(&self) -> Result<String, HubError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<&Notification> for ViewerEvent {
    fn from(notification: &Notification) -> Self {
        match notification {
            Notification::NewFrame { frame_count } => Self::NewFrame {
                frame_count: *frame_count,
            },
            Notification::NewShape => Self::NewShape,
            Notification::Error { message } => {
                Self::ErrorMessage(message.clone())
            }
            Notification::Stopped => Self::SimStopped,
        }
    }
}

/// Output queued for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerOutput {
    /// Send an event.
    Event(ViewerEvent),
    /// Close the connection with the given code.
    Close(u16),
}

struct Outbox {
    tx: Sender<ViewerOutput>,
}

impl Outbox {
    fn push(&self, output: ViewerOutput) {
        // The transport is gone; the session is about to be dropped.
        let _ = self.tx.send(output);
    }
}

impl Subscriber for Outbox {
    fn deliver(&self, notification: &Notification) {
        self.push(ViewerOutput::Event(notification.into()));
    }
}

/// State of one viewer connection.
pub struct ViewerSession {
    manager: Arc<InstanceManager>,
    outbox: Arc<Outbox>,
    /// `outbox` as registered in subscription groups.
    subscriber: Arc<dyn Subscriber>,
    simulation: Option<SimulationId>,
}

impl ViewerSession {
    /// New, unconnected session and the receiver of its output.
    #[must_use]
    pub fn new(manager: Arc<InstanceManager>) -> (Self, Receiver<ViewerOutput>) {
        let (tx, rx) = mpsc::channel();
        let outbox = Arc::new(Outbox { tx });
        let subscriber: Arc<dyn Subscriber> = outbox.clone();
        let session = Self {
            manager,
            outbox,
            subscriber,
            simulation: None,
        };
        (session, rx)
    }

    /// Simulation currently followed.
    #[must_use]
    pub fn simulation(&self) -> Option<SimulationId> {
        self.simulation
    }

    /// Parse and handle one request.
    pub fn handle_text(&mut self, text: &str) -> Result<(), HubError> {
        self.handle(text.parse()?)
    }

    /// Handle one request.
    pub fn handle(&mut self, request: ViewerRequest) -> Result<(), HubError> {
        match request {
            ViewerRequest::ConnectTo(id) => {
                if self.manager.archive().catalog().lookup(id).is_none() {
                    log::info!("viewer asked for unknown simulation {id}");
                    self.outbox.push(ViewerOutput::Close(CLOSE_UNKNOWN_SIMULATION));
                    return Ok(());
                }
                self.subscribe(id);
                self.send_header(id)
            }
            ViewerRequest::GetHeader => self.send_header(self.connected()?),
            ViewerRequest::Stop => {
                let _ = self.manager.stop(self.connected()?);
                Ok(())
            }
            ViewerRequest::Reload => {
                let id = self.connected()?;
                if self.manager.is_running(id) {
                    return self.manager.reload(id);
                }
                // Offline: relaunch cold. The old group is gone, so join
                // the new one before the worker starts reporting.
                self.subscribe(id);
                self.manager.resurrect(id)?;
                self.send_header(id)
            }
        }
    }

    fn connected(&self) -> Result<SimulationId, HubError> {
        self.simulation.ok_or_else(|| {
            HubError::NotFound("viewer is not connected to a simulation".into())
        })
    }

    fn subscriber(&self) -> Arc<dyn Subscriber> {
        Arc::clone(&self.subscriber)
    }

    fn subscribe(&mut self, id: SimulationId) {
        let subscriptions = self.manager.subscriptions();
        let me = self.subscriber();
        if let Some(previous) = self.simulation {
            subscriptions.remove(previous, &me);
        }
        subscriptions.add(id, me);
        self.simulation = Some(id);
    }

    fn send_header(&self, id: SimulationId) -> Result<(), HubError> {
        let header = self.manager.header(id)?;
        self.outbox.push(ViewerOutput::Event(ViewerEvent::Header(header)));
        Ok(())
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        if let Some(id) = self.simulation {
            self.manager.subscriptions().remove(id, &self.subscriber());
        }
    }
}
