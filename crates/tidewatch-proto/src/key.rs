/// Normalizes a requested path into the session key used to correlate
/// transfer envelopes.
///
/// Keys are compared case-insensitively with `/` and `\` treated as the same
/// separator, so `C:/Logs//a.txt` and `c:\logs\A.TXT` collapse to one key.
pub fn normalize_key(path: &str) -> String {
    let mut key = String::with_capacity(path.len());
    let mut previous_separator = false;
    for ch in path.trim().chars() {
        if ch == '/' || ch == '\\' {
            if !previous_separator {
                key.push('\\');
            }
            previous_separator = true;
        } else {
            previous_separator = false;
            key.extend(ch.to_uppercase());
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn separators_and_case_collapse_to_one_key() {
        assert_eq!(normalize_key("C:/Logs//a.txt"), normalize_key("c:\\logs\\A.TXT"));
        assert_eq!(normalize_key("/srv/data/x.bin"), "\\SRV\\DATA\\X.BIN");
    }

    #[test_timeout::timeout]
    fn distinct_paths_stay_distinct() {
        assert_ne!(normalize_key("/srv/a.txt"), normalize_key("/srv/b.txt"));
        assert_ne!(normalize_key("/srv/a.txt"), normalize_key("/srv/a.txt.bak"));
    }

    #[test_timeout::timeout]
    fn surrounding_whitespace_is_ignored() {
        assert_eq!(normalize_key("  /tmp/x \n"), normalize_key("/tmp/x"));
    }
}
