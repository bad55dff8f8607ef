use mvil_core::OTHER_ROLE_FAMILY;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleMatch {
    pub role_family: String,
    pub canonical_title: String,
}

impl TitleMatch {
    pub(crate) fn other(canonical_title: String) -> Self {
        Self {
            role_family: OTHER_ROLE_FAMILY.to_string(),
            canonical_title,
        }
    }
}

/// Lowercased word tokens; `+` and `#` survive so `c++`/`c#` stay distinct.
pub(crate) fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '+' || c == '#' {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .map(ToString::to_string)
        .collect()
}

/// Drops bracketed annotations such as `(Remote)` or `[Contract]`.
fn strip_annotations(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                out.push(' ');
            }
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

fn remove_phrase(tokens: &mut Vec<String>, phrase: &[String]) {
    if phrase.is_empty() || phrase.len() > tokens.len() {
        return;
    }
    let mut i = 0;
    while i + phrase.len() <= tokens.len() {
        if tokens[i..i + phrase.len()] == *phrase {
            tokens.drain(i..i + phrase.len());
        } else {
            i += 1;
        }
    }
}

pub(crate) fn clean_title(title: &str, boilerplate: &[Vec<String>]) -> String {
    let mut words = tokens(&strip_annotations(title));
    for phrase in boilerplate {
        remove_phrase(&mut words, phrase);
    }
    words.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boilerplate() -> Vec<Vec<String>> {
        ["urgent", "urgently needed", "jobs at", "hiring"]
            .iter()
            .map(|p| tokens(p))
            .collect()
    }

    #[test]
    fn strips_boilerplate_and_annotations() {
        assert_eq!(
            clean_title("URGENT!! Data Analyst (Lagos) [Contract]", &boilerplate()),
            "data analyst"
        );
        assert_eq!(
            clean_title("Data Analyst Jobs at Acme", &boilerplate()),
            "data analyst acme"
        );
        assert_eq!(clean_title("C++ / C# Developer", &[]), "c++ c# developer");
    }

    #[test]
    fn unbalanced_brackets_do_not_panic() {
        assert_eq!(clean_title("Analyst (remote", &[]), "analyst");
        assert_eq!(clean_title("Analyst) remote", &[]), "analyst remote");
        assert_eq!(clean_title("", &boilerplate()), "");
    }
}
