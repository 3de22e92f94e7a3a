//! Actor model implementation for the SFU.
//!
//! ```text
//! RoomRegistryActor (singleton per SFU instance)
//! └── supervises N RoomActors
//!     └── RoomActor (one per live room)
//!         ├── owns the routing context
//!         └── owns N PeerSessions
//!             ├── send / recv transport, producers, consumers
//!             └── ConnectionActorHandle (shared by every room the peer joined)
//! ```
//!
//! # Key Design Decisions
//!
//! - **No global lock**: room state is only touched inside its `RoomActor`
//! - **CancellationToken propagation**: the registry owns the root token,
//!   rooms run on child tokens
//! - **Generation-checked removal**: a room asks to be removed with its
//!   generation, so a late request never drops its successor
//! - **Non-blocking pushes**: rooms offer pushes to connection mailboxes with
//!   `try_send`; a slow client loses pushes, never stalls the room
//! - **Mailbox monitoring**: Room 100/500, Connection 50/200
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistryActor` singleton mapping codes to rooms
//! - [`room`] - `RoomActor` per live room
//! - [`connection`] - `ConnectionActor` per signaling connection
//! - [`session`] - Peer session ownership tree and cascading close
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod room;
pub mod session;

pub use connection::{ConnectionActor, ConnectionActorHandle, CONNECTION_CHANNEL_BUFFER};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxLevel, MailboxMonitor};
pub use registry::{RoomRegistryActor, RoomRegistryActorHandle};
pub use room::{RoomActor, RoomActorHandle};
