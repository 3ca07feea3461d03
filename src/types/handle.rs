//! Handle string helpers.
//!
//! A handle is a UTF-8 string of the form `prefix/suffix`. The prefix part is
//! case-insensitive; the suffix is case-sensitive. The administrative handle
//! for a prefix is `0.NA/PREFIX`, resolved against the global root service
//! when no local override is pinned.

/// Authority prefix under which every prefix's administrative handle lives.
pub const GLOBAL_ROOT_PREFIX: &str = "0.NA";

/// Separator between prefix and suffix.
pub const HANDLE_SEPARATOR: char = '/';

/// Extract the prefix part of a handle.
///
/// A handle with no separator is treated as being all prefix, matching how
/// the authority form `0.NA/PREFIX` nests: the prefix of `0.NA/10.5000` is
/// `0.NA`, the prefix of `10.5000/abc` is `10.5000`.
pub fn prefix_of(handle: &str) -> &str {
    match handle.find(HANDLE_SEPARATOR) {
        Some(idx) => &handle[..idx],
        None => handle,
    }
}

/// Suffix part of a handle, empty when there is no separator.
pub fn suffix_of(handle: &str) -> &str {
    match handle.find(HANDLE_SEPARATOR) {
        Some(idx) => &handle[idx + 1..],
        None => "",
    }
}

/// Build the `0.NA/PREFIX` authority handle responsible for `handle`.
///
/// Authority handles themselves delegate upward: the authority for
/// `0.NA/10.5000.200` is `0.NA/10.5000.200` stripped of one derived level
/// only during referral handling, not here.
pub fn authority_handle(handle: &str) -> String {
    let prefix = prefix_of(handle);
    if prefix.eq_ignore_ascii_case(GLOBAL_ROOT_PREFIX) {
        // Already an authority handle; it is its own discovery target.
        handle.to_string()
    } else {
        format!("{GLOBAL_ROOT_PREFIX}/{}", prefix)
    }
}

/// Whether `handle` is itself a prefix authority handle.
pub fn is_authority_handle(handle: &str) -> bool {
    prefix_of(handle).eq_ignore_ascii_case(GLOBAL_ROOT_PREFIX)
}

/// Canonical cache key for a handle: prefix uppercased, suffix untouched.
pub fn normalize_for_cache(handle: &str) -> String {
    match handle.find(HANDLE_SEPARATOR) {
        Some(idx) => {
            let (prefix, rest) = handle.split_at(idx);
            format!("{}{}", prefix.to_ascii_uppercase(), rest)
        }
        None => handle.to_ascii_uppercase(),
    }
}

/// Strip one dotted component from a derived prefix, e.g. `10.5000.200`
/// becomes `10.5000`. Returns `None` once no parent remains.
pub fn parent_prefix(prefix: &str) -> Option<&str> {
    prefix.rfind('.').map(|idx| &prefix[..idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_and_suffix_split() {
        assert_eq!(prefix_of("10.5000/abc"), "10.5000");
        assert_eq!(suffix_of("10.5000/abc"), "abc");
        assert_eq!(prefix_of("loneprefix"), "loneprefix");
        assert_eq!(suffix_of("loneprefix"), "");
        assert_eq!(suffix_of("0.NA/10/with/slashes"), "10/with/slashes");
    }

    #[test]
    fn authority_forms() {
        assert_eq!(authority_handle("10.5000/abc"), "0.NA/10.5000");
        assert_eq!(authority_handle("0.NA/10.5000"), "0.NA/10.5000");
        assert!(is_authority_handle("0.na/10"));
        assert!(!is_authority_handle("10/abc"));
    }

    #[test]
    fn cache_normalization_uppercases_prefix_only() {
        assert_eq!(normalize_for_cache("abc.Def/Suffix"), "ABC.DEF/Suffix");
        assert_eq!(normalize_for_cache("abc"), "ABC");
    }

    #[test]
    fn derived_prefix_parent() {
        assert_eq!(parent_prefix("10.5000.200"), Some("10.5000"));
        assert_eq!(parent_prefix("10"), None);
    }
}
