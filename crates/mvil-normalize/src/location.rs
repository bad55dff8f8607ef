const REMOTE_MARKERS: &[&str] = &["remote", "work from home", "wfh", "anywhere", "fully remote"];

fn title_case(part: &str) -> String {
    part.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `" lagos ,  NIGERIA "` -> `"Lagos, Nigeria"`; remote markers collapse to `"Remote"`.
pub fn normalize_location(raw: &str) -> String {
    let lower = raw.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let bare = lower.trim_matches(|c: char| !c.is_alphanumeric());
    if REMOTE_MARKERS.contains(&bare) {
        return "Remote".to_string();
    }
    lower
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(title_case)
        .collect::<Vec<_>>()
        .join(", ")
}
