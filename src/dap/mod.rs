//! Debug adapter protocol plumbing.
//!
//! - `codec`: incremental `Content-Length` framing for debuggee streams.
//! - `framer`: TCP connection to a debuggee built on the codec.
//! - `events`: bridge-originated events sent to the client.

pub mod codec;
pub mod events;
pub mod framer;

pub use codec::DapCodec;
pub use events::{OutputCategory, OutputEvent};
pub use framer::MessageFramer;
