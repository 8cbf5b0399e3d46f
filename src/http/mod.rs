//! HTTP/1.1 protocol handling for client connections.
//!
//! - **`connection`**: per-connection request/response state machine
//! - **`parser`**: parses requests out of a byte buffer
//! - **`request`** / **`response`**: message models
//! - **`writer`**: serialises responses onto the socket
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Wait for incoming request data
//!        └──────┬──────┘
//!               │ Request received (malformed → 400, then Closed)
//!               ▼
//!        ┌──────────────────┐
//!        │   Processing     │ ← Dispatcher: rate limit, select, forward
//!        └──────┬───────────┘
//!               │ Response ready
//!               ▼
//!        ┌──────────────────┐
//!        │    Writing       │ ← Send response to client
//!        └──────┬───────────┘
//!               │ Response sent
//!               ├─ Keep-Alive → Reading (same connection)
//!               └─ Close → Closed
//! ```

pub mod connection;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
