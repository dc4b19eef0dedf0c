// Truncate a &str to a byte budget at a char boundary (prefix)
#[inline]
pub fn take_bytes_at_char_boundary(s: &str, maxb: usize) -> &str {
    if s.len() <= maxb {
        return s;
    }
    let mut last_ok = 0;
    for (i, ch) in s.char_indices() {
        let nb = i + ch.len_utf8();
        if nb > maxb {
            break;
        }
        last_ok = nb;
    }
    &s[..last_ok]
}

// Take a suffix of a &str within a byte budget at a char boundary
#[inline]
pub fn take_last_bytes_at_char_boundary(s: &str, maxb: usize) -> &str {
    if s.len() <= maxb {
        return s;
    }
    let mut start = s.len();
    let mut used = 0usize;
    for (i, ch) in s.char_indices().rev() {
        let nb = ch.len_utf8();
        if used + nb > maxb {
            break;
        }
        start = i;
        used += nb;
    }
    &s[start..]
}

/// Keeps the head and tail of `s` within `max_bytes`, replacing the middle
/// with a marker that records how many bytes were dropped.
///
/// Returns the (possibly) shortened text and the number of removed bytes when
/// truncation happened. A budget too small for the marker keeps a plain prefix.
pub fn truncate_middle(s: &str, max_bytes: usize) -> (String, Option<usize>) {
    if s.len() <= max_bytes {
        return (s.to_string(), None);
    }

    // Sized for the widest count so the final marker never outgrows it.
    let marker_bound = truncation_marker(s.len()).len();
    if max_bytes < marker_bound {
        let head = take_bytes_at_char_boundary(s, max_bytes);
        return (head.to_string(), Some(s.len() - head.len()));
    }
    let budget = max_bytes - marker_bound;
    let head_budget = budget / 2;
    let tail_budget = budget - head_budget;

    let head = take_bytes_at_char_boundary(s, head_budget);
    let tail = take_last_bytes_at_char_boundary(s, tail_budget);
    let removed = s.len() - head.len() - tail.len();
    let marker = truncation_marker(removed);

    (format!("{head}{marker}{tail}"), Some(removed))
}

fn truncation_marker(removed: usize) -> String {
    format!("\n…{removed} bytes truncated…\n")
}
