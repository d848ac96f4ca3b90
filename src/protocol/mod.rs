//! Wire protocol for switchyard sockets
//!
//! Every message is a multipart: an ordered list of byte frames sent as one
//! unit. On TCP a multipart is framed as
//!
//! ```text
//! [u32 BE frame count] ( [u32 BE frame length] [frame bytes] )*
//! ```
//!
//! The typed encodings layered on top (broadcast frames, replay queries and
//! responses, dispatch and result envelopes, control messages) live in
//! [`messages`].

mod frames;
mod messages;

pub use frames::*;
pub use messages::*;
