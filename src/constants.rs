//! Shared constants for thread reconstruction and filtering.

// =============================================================================
// Filtering
// =============================================================================

/// Separator between entries of a keyword block list.
pub const KEYWORD_SEPARATOR: char = ';';

// =============================================================================
// Windows
// =============================================================================

/// Default age of the oldest record included in a board window, in days.
pub const DEFAULT_MAX_AGE_DAYS: u32 = 5;

/// Upper bound accepted for a window age (roughly ten years).
pub const MAX_WINDOW_AGE_DAYS: u32 = 3650;

/// Milliseconds per day, used to turn a window age into a cutoff timestamp.
pub const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

// =============================================================================
// Placeholders
// =============================================================================

/// Opening bracket of a synthesized placeholder subject.
pub const PLACEHOLDER_SUBJECT_OPEN: &str = "[";

/// Closing bracket of a synthesized placeholder subject.
pub const PLACEHOLDER_SUBJECT_CLOSE: &str = "]";
