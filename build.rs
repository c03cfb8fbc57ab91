use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Source-policy checks run on every build. Each rule is a line regex plus a
// filter that decides whether a matching line really is a violation.

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

struct Rule {
    name: &'static str,
    pattern: String,
    accept: fn(&str) -> bool,
    advice: &'static str,
    skip_build_script: bool,
}

// Collects the lines of one file that a rule flags.
struct LineCollector {
    accept: fn(&str) -> bool,
    violations: Vec<String>,
}

impl Sink for LineCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.accept)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///") || line.trim_start().starts_with("//!")
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with("//") || line.contains("/*")
}

/// Text after the comment marker, or `None` for lines that are not comments.
fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if is_doc_comment(line) {
        Some(trimmed[3..].trim())
    } else if trimmed.starts_with("//") {
        Some(trimmed[2..].trim())
    } else if let Some(idx) = line.find("/*") {
        match line[idx + 2..].find("*/") {
            Some(end) => Some(line[idx + 2..idx + 2 + end].trim()),
            None => Some(line[idx + 2..].trim()),
        }
    } else {
        None
    }
}

// Underscore names inside string literals or comments are not bindings.
fn underscore_binding(line: &str) -> bool {
    if is_comment(line) {
        return false;
    }
    !line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn stars_outside_docs(line: &str) -> bool {
    !is_doc_comment(line)
}

fn forbidden_word(line: &str) -> bool {
    comment_text(line).is_some()
}

fn all_uppercase(line: &str) -> bool {
    let Some(text) = comment_text(line) else {
        return false;
    };
    let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

fn any_line(_: &str) -> bool {
    true
}

fn rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "underscore-prefixed identifiers",
            pattern: r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            accept: underscore_binding,
            advice: "Either use the binding without the underscore or remove it completely.",
            skip_build_script: false,
        },
        Rule {
            name: "forbidden comment words",
            pattern: format!(r"(//|/\*).*(?:{})", FORBIDDEN_WORDS.join("|")),
            accept: forbidden_word,
            advice: "Comments describe the code as it is, not its history. Remove the comment.",
            skip_build_script: true,
        },
        Rule {
            name: "'**' in regular comments",
            pattern: r"(//|/\*).*\*\*".to_string(),
            accept: stars_outside_docs,
            advice: "Markdown emphasis belongs in doc comments only.",
            skip_build_script: true,
        },
        Rule {
            name: "all-uppercase comments",
            pattern: r"(//|/\*).*".to_string(),
            accept: all_uppercase,
            advice: "Delete the comment or write it in sentence case.",
            skip_build_script: true,
        },
        Rule {
            name: "#[allow(dead_code)] attributes",
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            accept: any_line,
            advice: "Either use the code or remove it completely.",
            skip_build_script: true,
        },
    ]
}

/// Every Rust file in the package, excluding build output and the vendored
/// reference material under `examples/`.
fn source_files() -> Vec<PathBuf> {
    WalkDir::new(".")
        .into_iter()
        .filter_entry(|e| {
            let path = e.path();
            !path.starts_with("./target") && !path.starts_with("./examples")
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn check_rule(rule: &Rule, files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern)?;
    let mut searcher = Searcher::new();
    for path in files {
        if rule.skip_build_script && path.file_name().is_some_and(|n| n == "build.rs") {
            continue;
        }
        let mut collector = LineCollector {
            accept: rule.accept,
            violations: Vec::new(),
        };
        if searcher.search_path(&matcher, path, &mut collector).is_err() {
            continue;
        }
        if !collector.violations.is_empty() {
            return Err(report(rule, path, &collector.violations).into());
        }
    }
    Ok(())
}

fn report(rule: &Rule, path: &Path, violations: &[String]) -> String {
    let mut message = format!(
        "\n❌ ERROR: Found {} {} in {}:\n",
        violations.len(),
        rule.name,
        path.display()
    );
    for violation in violations {
        message.push_str(&format!("   {violation}\n"));
    }
    message.push_str(&format!("\n⚠️ {}\n", rule.advice));
    message
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=krr");
    println!("cargo:rerun-if-changed=cli");
    println!("cargo:rerun-if-changed=tests");
    println!("cargo:rerun-if-changed=benches");

    let files = source_files();
    for rule in rules() {
        if let Err(e) = check_rule(&rule, &files) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
