//! Small shared helpers.

/// Format a 6-byte device address as a lowercase colon-separated string.
pub fn format_address(address: &[u8; 6]) -> String {
    address
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Environment variable lookup that never fails.
///
/// Missing or non-UTF-8 variables yield an empty string; values are passed
/// through verbatim with no defaults applied.
pub fn env_or_empty(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

/// Parse a menu selection in `[0, max]`.
///
/// Returns `None` for non-numeric or out-of-range input. `0` is the
/// back/quit entry and always valid.
pub fn parse_selection(line: &str, max: usize) -> Option<usize> {
    let choice = line.trim().parse::<usize>().ok()?;
    if choice <= max {
        Some(choice)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_format_address() {
        let addr = [0xC0, 0x4E, 0x30, 0x00, 0xAB, 0x01];
        assert_eq!(format_address(&addr), "c0:4e:30:00:ab:01");
    }

    #[test]
    fn test_env_or_empty_missing() {
        assert_eq!(env_or_empty("SENSORTILE_CLOUD_TEST_UNSET_VAR"), "");
    }

    #[test]
    fn test_env_or_empty_present() {
        std::env::set_var("SENSORTILE_CLOUD_TEST_SET_VAR", "value");
        assert_eq!(env_or_empty("SENSORTILE_CLOUD_TEST_SET_VAR"), "value");
        std::env::remove_var("SENSORTILE_CLOUD_TEST_SET_VAR");
    }

    #[test]
    fn test_parse_selection_in_range() {
        assert_eq!(parse_selection("3\n", 5), Some(3));
        assert_eq!(parse_selection("  5  ", 5), Some(5));
    }

    #[test]
    fn test_parse_selection_zero_is_back() {
        assert_eq!(parse_selection("0", 5), Some(0));
        assert_eq!(parse_selection("0\n", 0), Some(0));
    }

    #[test]
    fn test_parse_selection_out_of_range() {
        assert_eq!(parse_selection("6", 5), None);
        assert_eq!(parse_selection("1", 0), None);
    }

    #[test]
    fn test_parse_selection_non_numeric() {
        assert_eq!(parse_selection("abc", 5), None);
        assert_eq!(parse_selection("", 5), None);
        assert_eq!(parse_selection("-1", 5), None);
        assert_eq!(parse_selection("2.5", 5), None);
    }
}
