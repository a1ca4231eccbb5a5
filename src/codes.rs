//! Fixed replay-name ↔ 5-digit-code translation table used inside `X-rr`
//! headers.
//!
//! Digits 1-2 identify the app, 3-4 the sub-app, 5 whether this is the
//! `-random` variant of the replay. Names not present in the table pass
//! through unchanged in both directions.

use std::collections::HashMap;

use once_cell::sync::Lazy;

const TABLE: &[(&str, &str)] = &[
    ("hangout-video-10secs", "01000"),
    ("hangout-video-10secs-random", "01001"),
    ("netflix-auto-5secs", "02000"),
    ("netflix-auto-5secs-random", "02001"),
    ("skype-video-10secs", "03000"),
    ("skype-video-10secs-random", "03001"),
    ("spotify-normal-15secs", "04000"),
    ("spotify-normal-15secs-random", "04001"),
    ("viber-video-10secs", "05000"),
    ("viber-video-10secs-random", "05001"),
    ("youtube-144p", "06010"),
    ("youtube-240p", "06020"),
    ("youtube-360p", "06030"),
    ("youtube-480p", "06040"),
    ("youtube-720p", "06050"),
    ("youtube-oneStream", "06061"),
];

static NAME_TO_CODE: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| TABLE.iter().copied().collect());

static CODE_TO_NAME: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| TABLE.iter().map(|&(name, code)| (code, name)).collect());

/// Translates a replay name to its wire code, or returns `name` unchanged
/// if it is not in the table.
#[must_use]
pub fn name_to_code(name: &str) -> String {
    NAME_TO_CODE
        .get(name)
        .map(|code| (*code).to_owned())
        .unwrap_or_else(|| name.to_owned())
}

/// Translates a wire code to its replay name, or returns `code` unchanged
/// if it is not in the table.
#[must_use]
pub fn code_to_name(code: &str) -> String {
    CODE_TO_NAME
        .get(code)
        .map(|name| (*name).to_owned())
        .unwrap_or_else(|| code.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_name() {
        let code = name_to_code("youtube-360p");
        assert_eq!(code, "06030");
        assert_eq!(code_to_name(&code), "youtube-360p");
    }

    #[test]
    fn unknown_name_passes_through() {
        assert_eq!(name_to_code("some-future-replay"), "some-future-replay");
        assert_eq!(code_to_name("99999"), "99999");
    }
}
