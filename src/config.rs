// src/config.rs
//
// Compile-time constants for every variant. No variant reads a config file.

/// Document root for GET. Uploads land under `<ROOT_DIR>/uploads`.
pub const ROOT_DIR: &str = "/var/www/html";

/// Suffix appended to ROOT_DIR for uploaded files.
pub const UPLOAD_SUBDIR: &str = "uploads";

/// Index page served for GET "/".
pub const INDEX_FILE: &str = "server-index.html";

pub const SERVER_PORT: u16 = 8083;

/// Per-connection scratch buffer size; must be a multiple of BLOCK_SIZE.
pub const BUFFER_SIZE: usize = 64 * 1024;

/// O_DIRECT / filesystem block size: alignment unit for buffer address,
/// file offset, and write length.
pub const BLOCK_SIZE: usize = 4096;

const _: () = assert!(BUFFER_SIZE % BLOCK_SIZE == 0);

/// TCP listen backlog. Some transports use a smaller historical value;
/// see each binary for the value it actually passes to `listen(2)`.
pub const ACCEPT_BACKLOG: i32 = 4096;

/// Bounded batch size for draining the accept queue per outer-loop
/// iteration in the process/thread-per-connection transports.
pub const MAX_PENDING_ACCEPTS: usize = 2048;

/// AIO submission batch size before a forced `io_submit`.
pub const AIO_BATCH_SIZE: usize = 1024;

/// io_uring submission queue depth.
pub const URING_QUEUE_DEPTH: u32 = 8192;

/// SQPOLL idle timeout for the optimized io_uring variant.
pub const URING_SQPOLL_IDLE_MS: u32 = 2000;
