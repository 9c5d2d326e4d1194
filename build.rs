use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Source trees owned by this crate. Anything else under the manifest directory
// (build output, vendored material, reference checkouts) is not linted.
const SOURCE_DIRS: [&str; 4] = ["engine", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: &str = "FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE";

/// One source rule: a line regex, a filter that decides whether a matching
/// line really is a violation, and the explanation printed on failure.
struct Rule {
    title: &'static str,
    pattern: String,
    accepts: fn(&str) -> bool,
    advice: &'static str,
}

/// Collects the offending lines of a single file for one rule.
struct ViolationCollector<'r> {
    rule: &'r Rule,
    violations: Vec<String>,
}

impl<'r> ViolationCollector<'r> {
    fn new(rule: &'r Rule) -> Self {
        Self {
            rule,
            violations: Vec::new(),
        }
    }

    fn error_message(&self, file_path: &Path) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.title,
            file_path.display()
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.rule.advice));
        Some(error_msg)
    }
}

impl Sink for ViolationCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.rule.accepts)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_comment_line(line: &str) -> bool {
    line.trim_start().starts_with("//")
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

/// Underscore-prefixed identifiers in code, ignoring comments and string literals.
fn underscore_in_code(line: &str) -> bool {
    if is_comment_line(line) {
        return false;
    }
    let inside_string = line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'));
    !inside_string
}

fn stars_outside_doc_comment(line: &str) -> bool {
    !is_doc_comment(line)
}

/// A comment whose letters are all uppercase.
fn shouting_comment(line: &str) -> bool {
    let Some(idx) = line.find("//") else {
        return false;
    };
    let comment = line[idx..].trim_start_matches('/').trim_start_matches('!');
    let mut letters = comment.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

fn rules() -> Vec<Rule> {
    vec![
        Rule {
            title: "underscore-prefixed identifiers",
            pattern: r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            accepts: underscore_in_code,
            advice: "Underscore-prefixed names are not allowed in this project. Use the binding or remove it.",
        },
        Rule {
            title: "#[allow(dead_code)] attributes",
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            accepts: |_| true,
            advice: "#[allow(dead_code)] is forbidden. Either use the code or delete it.",
        },
        Rule {
            title: "forbidden comment words",
            pattern: format!(r"//.*(?:{FORBIDDEN_WORDS})"),
            accepts: |_| true,
            advice: "Comments narrating edits (FIX, NEW, UPDATE and friends) are forbidden. Remove them.",
        },
        Rule {
            title: "'**' in regular comments",
            pattern: r"//.*\*\*".to_string(),
            accepts: stars_outside_doc_comment,
            advice: "The '**' pattern is only allowed in doc comments.",
        },
        Rule {
            title: "all-uppercase comments",
            pattern: r"//.*[A-Z]".to_string(),
            accepts: shouting_comment,
            advice: "Comments written entirely in uppercase are forbidden. Consider deleting the comment.",
        },
    ]
}

fn source_files() -> impl Iterator<Item = PathBuf> {
    SOURCE_DIRS
        .into_iter()
        .filter(|dir| Path::new(dir).is_dir())
        .flat_map(|dir| {
            WalkDir::new(dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
                .map(|e| e.into_path())
        })
}

fn lint_sources() -> Result<(), Box<dyn Error>> {
    let rules = rules();
    let mut matchers = Vec::with_capacity(rules.len());
    for rule in &rules {
        matchers.push(RegexMatcher::new_line_matcher(&rule.pattern)?);
    }
    let mut searcher = Searcher::new();

    for path in source_files() {
        for (rule, matcher) in rules.iter().zip(&matchers) {
            let mut collector = ViolationCollector::new(rule);
            searcher.search_path(matcher, &path, &mut collector)?;
            if let Some(error_message) = collector.error_message(&path) {
                return Err(error_message.into());
            }
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    if let Err(e) = lint_sources() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
