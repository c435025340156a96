//! Application-wide constants
//!
//! This module contains all magic numbers and string literals used throughout
//! the daemon, providing a single source of truth for constant values.

/// Section and profile names with fixed meaning
pub mod sections {
    /// Global forced value for a key, wins over every per-profile default
    pub const OVERRIDE: &str = "override";

    /// Global last-resort default for a key
    pub const FALLBACK: &str = "fallback";

    /// Key → datatype label bindings
    pub const DATATYPE: &str = "datatype";

    /// Sections that are never profiles
    pub const SPECIALS: [&str; 3] = [OVERRIDE, FALLBACK, DATATYPE];

    /// Profiles that exist even when no file mentions them
    pub const BUILTIN_PROFILES: [&str; 4] = ["general", "silent", "meeting", "outdoors"];

    /// Active profile when no tag file exists
    pub const DEFAULT_PROFILE: &str = "general";

    /// Datatype label for keys without a binding
    pub const UNKNOWN_DATATYPE: &str = "UNKNOWN";
}

/// Service-root layout
pub mod paths {
    /// Application directory name under the platform data dir
    pub const APP_DIR: &str = "profiled";

    /// Root used when no platform data dir can be determined
    pub const FALLBACK_ROOT: &str = "fsroot";

    /// Socket file, relative to the root
    pub const SOCKET: &str = "tmp/profiled.socket";

    /// Temp directory, relative to the root
    pub const TMP_DIR: &str = "tmp";

    /// Configuration definition files, relative to the root
    pub const CONFIG_DIR: &str = "etc/profiles";

    /// Values and profile tag, relative to the root
    pub const VALUES_DIR: &str = "var/profiles";

    /// Values file name inside VALUES_DIR
    pub const VALUES_FILE: &str = "values.ini";

    /// Active profile tag file name inside VALUES_DIR
    pub const PROFILE_TAG_FILE: &str = "current";

    /// Extension of Configuration definition files
    pub const CONFIG_EXTENSION: &str = "ini";

    /// Suffix of the temporary sibling written during save
    pub const TEMP_SUFFIX: &str = "tmp";

    /// Suffix of the backup sibling kept during save
    pub const BACKUP_SUFFIX: &str = "bak";
}

/// Wire protocol constants
pub mod wire {
    /// Size of the big-endian length prefix in bytes
    pub const PREFIX_SIZE: usize = 4;

    /// Largest accepted message body (1 MiB)
    pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

    /// Suffix of request tags
    pub const REQUEST_SUFFIX: &str = ".req";

    /// Suffix of response tags
    pub const RESPONSE_SUFFIX: &str = ".rsp";

    /// Bytes read from a readable connection per readiness event
    pub const READ_CHUNK: usize = 4096;

    /// Socket file permissions (owner only)
    pub const SOCKET_MODE: u32 = 0o700;
}
