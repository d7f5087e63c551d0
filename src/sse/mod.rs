//! Server-Sent Events endpoint.
//!
//! `GET /events` authenticates the client, claims its session for this
//! instance and streams frames until the client disconnects, the connection
//! is replaced, or the instance drains.
//!
//! # Connect sequence
//!
//! 1. Retire an existing local connection of the same user (`reconnect`)
//! 2. Register the connection and subscribe the user's channel
//! 3. Replay logged events after the resume cursor
//! 4. Flush the offline inbox between `queued_flush` markers
//! 5. Send `connected`, open the connection to live traffic, start heartbeats
//!
//! Credentials are read from `Authorization: Bearer`, `?token=` or the
//! `token` cookie; the resume cursor from `Last-Event-ID` or `?lastEventId=`.

mod handler;

pub use handler::sse_handler;
