//! Control plane between the monitor and its agents.
//!
//! Each agent holds one TCP connection to the monitor's loopback listener.
//! Both directions carry fixed 8-byte frames (see [`CommandFrame`]). The
//! agent opens with `OK(agent_id)`, answers every command with `OK`, and
//! sends `CLOSE(agent_id)` once when it goes away.

mod frame;
mod monitor;
mod receiver;

pub use frame::{read_frame, write_frame, CommandCode, CommandFrame, FRAME_LEN};
pub use monitor::{GrandAgentMonitor, MonitorCommand, MonitorHandle, MonitorSnapshot};
pub use receiver::{CommandReceiver, Directive};
