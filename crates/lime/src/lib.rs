//! Lime protocol client and server building blocks.
//!
//! # Crate Structure
//!
//! - [`envelope`]: messages, notifications, commands and sessions
//! - [`frame`]: self-delimited JSON framing of the byte stream
//! - [`transport`]: TCP and in-memory envelope transports
//! - [`channel`]: session state machine, builders and on-demand channels

/// Re-export envelope types.
pub mod envelope {
    pub use lime_envelope::*;
}

/// Re-export framing types.
pub mod frame {
    pub use lime_frame::*;
}

/// Re-export transport types.
pub mod transport {
    pub use lime_transport::*;
}

/// Re-export channel types.
pub mod channel {
    pub use lime_channel::*;
}
