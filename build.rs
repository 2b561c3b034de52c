//! Source policy for the engine crates: no underscore-silenced bindings and
//! no `allow(dead_code)` escapes. Unused code is removed, not hidden.

use grep::matcher::Matcher;
use grep::regex::RegexMatcher;
use grep::searcher::sinks::UTF8;
use grep::searcher::Searcher;
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const SOURCE_DIRS: [&str; 6] = ["engine", "factor", "decompose", "assoc", "tests", "benches"];

struct Rule {
    name: &'static str,
    pattern: &'static str,
    hint: &'static str,
}

const RULES: [Rule; 2] = [
    Rule {
        name: "underscore-prefixed identifier",
        pattern: r"\b_[A-Za-z0-9][A-Za-z0-9_]*\b",
        hint: "use the binding or drop it",
    },
    Rule {
        name: "dead code allowance",
        pattern: r"#!?\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        hint: "delete the unused item",
    },
];

fn crate_sources() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(Result::ok))
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "rs"))
        .collect()
}

/// Lines of `path` matching `matcher` once string literals are blanked out.
fn offending_lines(
    searcher: &mut Searcher,
    matcher: &RegexMatcher,
    path: &Path,
) -> Result<Vec<String>, Box<dyn Error>> {
    let mut hits = Vec::new();
    searcher.search_path(
        matcher,
        path,
        UTF8(|line_number, line| {
            let code = line.split('"').step_by(2).collect::<Vec<&str>>().join("\"\"");
            if matcher.is_match(code.as_bytes())? {
                hits.push(format!("{}:{}: {}", path.display(), line_number, line.trim_end()));
            }
            Ok(true)
        }),
    )?;
    Ok(hits)
}

fn check(rule: &Rule, sources: &[PathBuf]) -> Result<Vec<String>, Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
    let mut searcher = Searcher::new();
    let mut violations = Vec::new();
    for path in sources {
        violations.extend(offending_lines(&mut searcher, &matcher, path)?);
    }
    Ok(violations)
}

fn main() {
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }
    println!("cargo:rerun-if-changed=build.rs");

    let sources = crate_sources();
    let mut failed = false;
    for rule in &RULES {
        match check(rule, &sources) {
            Ok(violations) if violations.is_empty() => {}
            Ok(violations) => {
                failed = true;
                eprintln!("found {} {} violation(s), {}:", violations.len(), rule.name, rule.hint);
                for line in violations {
                    eprintln!("  {line}");
                }
            }
            Err(e) => println!("cargo:warning=could not scan for {}: {e}", rule.name),
        }
    }
    if failed {
        std::process::exit(1);
    }
}
