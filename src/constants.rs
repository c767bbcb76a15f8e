// Takeout Migrate Constants
// Layout and naming rules of the Takeout export. Changing any of these changes
// which files a resumed run considers already done.

pub const STATE_VERSION: u32 = 1;

// Paths
pub const STATE_FOLDER: &str = ".takeout-migrate";
pub const STATE_FILENAME: &str = "state.json";
pub const LOCK_FILENAME: &str = "state.lock";
pub const REPORTS_FOLDER: &str = "reports";
pub const EXTRACTED_MARKER: &str = ".extracted";
pub const PARTIAL_PREFIX: &str = ".";
pub const PARTIAL_SUFFIX: &str = ".partial";
pub const TEMP_FILE_PREFIX: &str = ".tmp_";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const UNIT_SEPARATOR: char = '/';

// Hashing
pub const HASH_CHUNK_SIZE: usize = 1_048_576; // 1MB
pub const HASH_FAST_SCHEME: &str = "first_last_size_v1";

// Concurrency defaults
pub const DEFAULT_WORKERS: usize = 4;
pub const PROGRESS_LOG_EVERY: u64 = 100;

// Archives
pub const ARCHIVE_EXTENSIONS: [&str; 1] = ["zip"];

// Album roots inside an extracted archive, first match wins
pub const DEFAULT_ALBUM_ROOTS: [&str; 3] = [
    "Takeout/Google Photos",
    "Takeout/Google Fotos",
    "Google Photos",
];

// Auto-generated year albums ("Photos from 2023")
pub const AUTO_ALBUM_PATTERN: &str = r"^(?i)(photos from|fotos von|fotos de|photos de) (\d{4})$";

// Sidecars
pub const SIDECAR_EXTENSION: &str = "json";
pub const SUPPLEMENTAL_MARKER: &str = "supplemental-metadata";
pub const ALBUM_METADATA_NAMES: [&str; 3] = ["metadata.json", "metadaten.json", "métadonnées.json"];
pub const NON_ITEM_JSON: [&str; 3] = [
    "print-subscriptions.json",
    "shared_album_comments.json",
    "user-generated-memory-titles.json",
];
pub const DEFAULT_EDITED_SUFFIXES: [&str; 5] = ["-edited", "-bearbeitet", "-modifié", "-editado", "-modificato"];

// The fuzzy layer needs a shared prefix longer than this
pub const DEFAULT_FUZZY_MIN_PREFIX: usize = 10;
// Media stems shorter than this are never considered truncated
pub const DEFAULT_TRUNCATED_MIN_LEN: usize = 20;

// Import monitoring
pub const DEFAULT_HEALTH_CHECK_INTERVAL: usize = 50;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 15;
pub const DEFAULT_IMPORT_BATCH_SIZE: usize = 200;
pub const TOOL_OUTPUT_EXCERPT: usize = 200;

// Import tool output that means the destination app is not reachable
pub const APP_UNAVAILABLE_MARKERS: [&str; 5] = [
    "photos is not running",
    "could not connect",
    "application isn't running",
    "connection invalid",
    "photos library is not available",
];
// Checked only on a zero exit, with the file path and album names removed
pub const DUPLICATE_MARKERS: [&str; 4] = [
    "skipping duplicate",
    "skipped duplicate",
    "duplicate skipped",
    "already in library",
];

// Exit codes
pub const EXIT_OK: i32 = 0;
pub const EXIT_FATAL: i32 = 1;
pub const EXIT_PARTIAL: i32 = 2;
pub const EXIT_INTERRUPTED: i32 = 3;

// Image extensions
pub const IMAGE_EXTENSIONS: [&str; 11] = [
    "jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "heic", "heif", "webp", "dng",
];

// Video extensions
pub const VIDEO_EXTENSIONS: [&str; 9] = [
    "mp4", "mov", "m4v", "avi", "3gp", "mkv", "mts", "m2ts", "wmv",
];
