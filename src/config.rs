//! Protocol and Pipeline Constants
//!
//! This module gathers every fixed parameter of the ingestion pipeline: the
//! OpenPGP framing limits used by the packet decoder, the sizes the streaming
//! engine works with, the default retry budget of the broker client and the
//! exchange / routing-key names of the message fabric.
//!
//! ## Conventions
//!
//! - Values that are part of a wire format (tags, trailer bytes, lengths) are
//!   taken from RFC 4880 and must never change.
//! - Values that are operational defaults (retry budget, queue names) can be
//!   overridden from the settings file; the constants here are only the
//!   fallback used when a field is absent.

/// Application name used in log lines and the CLI banner.
pub const APP_NAME: &str = "lega-ingest";

// === Streaming Engine ===

/// Size of one ciphertext segment read by the streaming engine.
///
/// The engine never holds more than one segment of ciphertext (plus the
/// 22-byte MDC hold-back) in memory, whatever the payload size. 64 KiB keeps
/// the number of read syscalls low without making the per-job footprint
/// noticeable.
pub const SEGMENT_SIZE: usize = 64 * 1024;

/// Largest body accepted for a non-streamed packet (keys, user ids, session keys).
///
/// Header packets are read fully into memory; anything larger than this is
/// treated as a malformed container instead of an allocation request.
pub const MAX_PACKET_BODY: usize = 1024 * 1024;

/// Length of the SHA-1 digest carried by a modification detection code.
pub const MDC_DIGEST_LEN: usize = 20;

/// Length of the complete MDC packet (`0xD3`, `0x14`, 20 digest bytes).
pub const MDC_PACKET_LEN: usize = 2 + MDC_DIGEST_LEN;

/// Header of the MDC packet: new-format tag 19 with a one-byte length of 20.
pub const MDC_HEADER: [u8; 2] = [0xD3, 0x14];

/// Version byte of a symmetrically encrypted integrity protected data packet.
pub const SEIPD_VERSION: u8 = 1;

/// Version byte of a public-key encrypted session key packet.
pub const PKESK_VERSION: u8 = 3;

/// Version byte of the only public-key packet layout we read.
pub const KEY_VERSION: u8 = 4;

/// Key id of a PKESK packet that does not name its recipient.
pub const WILDCARD_KEY_ID: [u8; 8] = [0u8; 8];

// === String-to-Key ===

/// Length of the salt of salted and iterated S2K specifiers.
pub const S2K_SALT_LEN: usize = 8;

/// Upper bound of the decoded iteration count (coded count 255).
///
/// `(16 + 15) << (15 + 6)` bytes, about 65 MB of hashing.
pub const S2K_MAX_COUNT: usize = 65_011_712;

// === Archive Layout ===

/// Width of the zero-padded job id used as archive file name.
pub const ARCHIVE_ID_WIDTH: usize = 20;

/// Number of characters per directory level of the archive layout.
pub const ARCHIVE_SEGMENT_WIDTH: usize = 3;

// === Broker ===

/// Default number of connection attempts before the failure callback runs.
pub const DEFAULT_CONNECTION_ATTEMPTS: u32 = 30;

/// Default delay between the first connection attempts, in milliseconds.
///
/// The delay doubles every ten attempts, see [`crate::broker::Backoff`].
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// Default ceiling of the backoff delay, in milliseconds.
pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Default number of times a message failing transiently is requeued
/// before it is dead-lettered.
pub const DEFAULT_MAX_REDELIVERIES: u32 = 5;

/// Default time a database statement waits on a locked database, in milliseconds.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Consumer tag announced to the broker, suffixed with the worker name.
pub const CONSUMER_TAG_PREFIX: &str = "lega-ingest";

/// Number of unacknowledged messages a worker may hold.
pub const PREFETCH_COUNT: u16 = 1;

/// Queue the dispatcher consumes from by default.
pub const DEFAULT_QUEUE: &str = "files";

/// Exchange facing the submitting party (the central registry).
pub const USER_EXCHANGE: &str = "cega";

/// Exchange facing the local operators.
pub const OPERATOR_EXCHANGE: &str = "lega";

/// Routing key of from-user error reports.
pub const USER_ERROR_ROUTING_KEY: &str = "files.error";

/// Routing key of successfully verified files.
pub const VERIFIED_ROUTING_KEY: &str = "files.verified";

/// Routing key of operator error reports.
pub const OPERATOR_ERROR_ROUTING_KEY: &str = "system.error";

/// Content type of every published message.
pub const CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode of every published message (persistent).
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;
