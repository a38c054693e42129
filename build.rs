use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories that hold this crate's own Rust sources. Anything else under the
// package root (vendored reference code, target/) is not linted.
const SOURCE_DIRS: [&str; 5] = ["model", "pack", "src", "tests", "benches"];

// Words that may not appear in comments. Matching is case-sensitive and does
// not look at word boundaries.
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

// One source policy. Each rule has a line regex and a second, line-level
// filter that decides whether a regex match is a real violation.
#[derive(Clone, Copy, Debug)]
enum Rule {
    UnderscorePrefix,
    ForbiddenWord,
    StarsInComment,
    AllCapsComment,
    AllowDeadCode,
}

impl Rule {
    const ALL: [Rule; 5] = [
        Rule::UnderscorePrefix,
        Rule::ForbiddenWord,
        Rule::StarsInComment,
        Rule::AllCapsComment,
        Rule::AllowDeadCode,
    ];

    fn pattern(self) -> String {
        match self {
            Rule::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            Rule::ForbiddenWord => format!(r"(//|/\*|///).*(?:{})", FORBIDDEN_WORDS.join("|")),
            Rule::StarsInComment => r"(//|/\*).*\*\*".to_string(),
            Rule::AllCapsComment => r"(//|/\*|///).*".to_string(),
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    // The build script spells out the comment patterns in its own source, so
    // only the identifier rule is applied to it.
    fn applies_to_build_script(self) -> bool {
        matches!(self, Rule::UnderscorePrefix)
    }

    fn is_violation(self, line_text: &str) -> bool {
        match self {
            Rule::UnderscorePrefix => !is_pure_comment(line_text) && !is_in_string(line_text),
            Rule::ForbiddenWord | Rule::AllowDeadCode => true,
            Rule::StarsInComment => !is_doc_comment(line_text),
            Rule::AllCapsComment => comment_text(line_text).is_some_and(|text| {
                let alpha: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
                !alpha.is_empty() && alpha.iter().all(|c| c.is_uppercase())
            }),
        }
    }

    fn explanation(self) -> String {
        match self {
            Rule::UnderscorePrefix => "Underscore-prefixed variable names are not allowed in this project.\n   \
                 Either use the variable (removing the underscore) or remove it completely."
                .to_string(),
            Rule::ForbiddenWord => format!(
                "Comments containing {} are STRICTLY FORBIDDEN in this project.\n   \
                 Remove them completely rather than commenting them out.",
                FORBIDDEN_WORDS
                    .iter()
                    .map(|word| format!("'{word}'"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Rule::StarsInComment => {
                "The '**' pattern is not allowed in regular comments (but is allowed in doc comments)."
                    .to_string()
            }
            Rule::AllCapsComment => "Comments where all alphabetic characters are uppercase are STRICTLY FORBIDDEN in this project.\n   \
                 STRONGLY CONSIDER deleting the comment completely."
                .to_string(),
            Rule::AllowDeadCode => "#[allow(dead_code)] attributes are STRICTLY FORBIDDEN in this project.\n   \
                 Either use the code (removing the attribute) or remove it completely."
                .to_string(),
        }
    }
}

// Collects the offending lines of one file for one rule.
struct RuleCollector {
    rule: Rule,
    violations: Vec<String>,
}

impl Sink for RuleCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.rule.is_violation(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///")
}

fn is_pure_comment(line: &str) -> bool {
    line.trim_start().starts_with("//")
        || (line.contains("/*") && !line.contains("*/match") && !line.contains("*/let"))
}

// Whether an underscore word sits between a pair of double quotes.
fn is_in_string(line: &str) -> bool {
    line.contains('"')
        && line
            .split('"')
            .enumerate()
            .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

// The text of a comment line without its marker.
fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///") {
        Some(rest.trim())
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        Some(rest.trim())
    } else if let Some(idx) = line.find("/*") {
        let rest = &line[idx + 2..];
        Some(rest.find("*/").map_or(rest, |end| &rest[..end]).trim())
    } else {
        None
    }
}

fn source_files() -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect();
    files.push(PathBuf::from("build.rs"));
    files
}

fn scan_sources() -> Result<(), Box<dyn Error>> {
    let files = source_files();
    let mut searcher = Searcher::new();
    for rule in Rule::ALL {
        let matcher = RegexMatcher::new_line_matcher(&rule.pattern())?;
        for path in &files {
            if path == Path::new("build.rs") && !rule.applies_to_build_script() {
                continue;
            }
            let mut collector = RuleCollector {
                rule,
                violations: Vec::new(),
            };
            searcher.search_path(&matcher, path, &mut collector)?;
            if !collector.violations.is_empty() {
                return Err(report(rule, path, &collector.violations).into());
            }
        }
    }
    Ok(())
}

fn report(rule: Rule, path: &Path, violations: &[String]) -> String {
    let mut error_msg = format!(
        "\n❌ ERROR: {:?} check failed with {} violations in {}:\n",
        rule,
        violations.len(),
        path.display()
    );
    for violation in violations {
        error_msg.push_str(&format!("   {violation}\n"));
    }
    error_msg.push_str(&format!("\n⚠️ {}\n", rule.explanation()));
    error_msg
}

// Compiles this script with the lints the crate denies, so the build script
// follows the same policy as the library.
fn check_build_script_lints() {
    let Ok(out_dir) = std::env::var("OUT_DIR") else {
        return;
    };
    let output = std::process::Command::new("rustc")
        .args([
            "--edition",
            "2024",
            "-D",
            "unused_variables",
            "-D",
            "dead_code",
            "-D",
            "unused_imports",
            "--crate-type",
            "bin",
            "--emit",
            "metadata",
            "--out-dir",
        ])
        .arg(&out_dir)
        .arg("build.rs")
        .output();

    match output {
        Ok(output) if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let problems = [
                ("unused variable", "Unused variables"),
                ("never used", "Unused functions"),
                ("unused import", "Unused imports"),
            ];
            if let Some((_, what)) = problems.iter().find(|(needle, _)| stderr.contains(needle)) {
                eprintln!("\n❌ ERROR: {what} detected in build.rs!");
                eprintln!("{stderr}");
                eprintln!("\n⚠️ {what} are STRICTLY FORBIDDEN in this project.");
                std::process::exit(1);
            }
        }
        Ok(_) => {}
        Err(_) => {
            println!("cargo:warning=Could not check build.rs for unused code");
        }
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    check_build_script_lints();

    if let Err(e) = scan_sources() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
