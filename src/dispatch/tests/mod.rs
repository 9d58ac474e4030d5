//! Engine-level coverage, driven through the public `BulkSender` surface
//! against the in-memory transport.
//!
//! Each file exercises one domain:
//! - [`accounts`] - pairing, ownership, group discovery
//! - [`submit`] - intake validation and task launch
//! - [`control`] - status queries and stop requests
//! - [`execution`] - the send loop: ordering, cadence, retry, recovery
//! - [`lifecycle`] - eviction and shutdown

mod control;
