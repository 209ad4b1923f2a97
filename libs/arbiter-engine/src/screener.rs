//! Static safety screening.
//!
//! A deny-list pass over the raw source that runs before anything is
//! compiled or executed. It catches the obvious attempts (spawning
//! processes, touching the filesystem, opening sockets, evaluating strings
//! as code, poking interpreter internals) so they fail fast with a message
//! the learner can act on. It is not the security boundary; the sandbox
//! limits are.

use arbiter_common::Language;
use thiserror::Error;

/// Largest accepted source file
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    #[error("disallowed construct: {matched_construct}")]
    DeniedConstruct { matched_construct: String },
    #[error("source code is {size} bytes, the limit is {limit} bytes")]
    SourceTooLarge { size: usize, limit: usize },
}

impl SafetyViolation {
    fn denied(construct: impl Into<String>) -> Self {
        SafetyViolation::DeniedConstruct {
            matched_construct: construct.into(),
        }
    }
}

struct DenyList {
    /// Root module / package / header names that may not be imported
    modules: &'static [&'static str],
    /// Free-standing calls: `name(` with an identifier boundary before it
    calls: &'static [&'static str],
    /// Whole identifiers denied anywhere
    keywords: &'static [&'static str],
    /// Plain substrings denied anywhere
    tokens: &'static [&'static str],
}

const PYTHON: DenyList = DenyList {
    modules: &[
        "os", "sys", "subprocess", "shutil", "socket", "ctypes", "cffi", "multiprocessing",
        "threading", "_thread", "signal", "pty", "posix", "resource", "fcntl", "mmap",
        "importlib", "builtins", "pathlib", "tempfile", "glob", "io", "pickle", "marshal",
        "shelve", "urllib", "http", "requests", "ftplib", "smtplib", "telnetlib", "asyncio",
        "select", "selectors", "inspect", "gc", "code", "codeop",
    ],
    calls: &[
        "eval", "exec", "compile", "open", "file", "__import__", "breakpoint", "globals",
        "vars",
    ],
    keywords: &[],
    tokens: &[
        "__builtins__", "__subclasses__", "__globals__", "__code__", "__loader__", "__import__",
    ],
};

const JAVASCRIPT: DenyList = DenyList {
    modules: &[
        "child_process", "fs", "net", "dgram", "http", "https", "http2", "tls", "dns", "os",
        "cluster", "worker_threads", "vm", "v8", "inspector", "module", "repl", "process",
    ],
    calls: &["eval", "Function", "setTimeout", "setInterval"],
    keywords: &[],
    tokens: &[
        "process.binding",
        "process.dlopen",
        "process.kill",
        "process.env",
        "process.chdir",
        "process.mainModule",
        "globalThis.process",
        "WebAssembly",
    ],
};

const CPP: DenyList = DenyList {
    modules: &[
        "fstream", "filesystem", "thread", "future", "csignal", "signal.h", "unistd.h",
        "fcntl.h", "dlfcn.h", "spawn.h", "sys/socket.h", "sys/wait.h", "sys/mman.h",
        "sys/ptrace.h", "sys/syscall.h", "netinet/in.h", "arpa/inet.h", "netdb.h", "windows.h",
    ],
    calls: &[
        "system", "popen", "fork", "vfork", "execl", "execlp", "execle", "execv", "execvp",
        "execve", "socket", "connect", "fopen", "freopen", "open", "unlink", "kill", "syscall",
        "dlopen", "ptrace", "clone",
    ],
    keywords: &["asm", "__asm", "__asm__"],
    tokens: &[],
};

fn deny_list(language: Language) -> &'static DenyList {
    match language {
        Language::Python => &PYTHON,
        Language::JavaScript => &JAVASCRIPT,
        Language::Cpp => &CPP,
    }
}

/// Screen source code before execution.
///
/// Returns the first disallowed construct found. Checks run in a fixed order
/// (size, imports, calls, keywords, tokens) so the reported construct is
/// deterministic for a given input.
pub fn screen(code: &str, language: Language) -> Result<(), SafetyViolation> {
    if code.len() > MAX_SOURCE_CODE_BYTES {
        return Err(SafetyViolation::SourceTooLarge {
            size: code.len(),
            limit: MAX_SOURCE_CODE_BYTES,
        });
    }

    let rules = deny_list(language);

    match language {
        Language::Python => check_python_imports(code, rules)?,
        Language::JavaScript => check_js_modules(code, rules)?,
        Language::Cpp => check_cpp_includes(code, rules)?,
    }

    for name in rules.calls {
        if contains_call(code, name) {
            return Err(SafetyViolation::denied(format!("{}(", name)));
        }
    }

    for keyword in rules.keywords {
        if contains_identifier(code, keyword) {
            return Err(SafetyViolation::denied(*keyword));
        }
    }

    for token in rules.tokens {
        if code.contains(token) {
            return Err(SafetyViolation::denied(*token));
        }
    }

    Ok(())
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn preceded_by_ident_or_dot(code: &str, idx: usize) -> bool {
    matches!(code[..idx].chars().next_back(), Some(c) if is_ident_char(c) || c == '.')
}

/// `name(` as a free-standing call. Method calls (`re.compile(`) don't count.
fn contains_call(code: &str, name: &str) -> bool {
    code.match_indices(name).any(|(idx, _)| {
        !preceded_by_ident_or_dot(code, idx)
            && code[idx + name.len()..].trim_start().starts_with('(')
    })
}

fn contains_identifier(code: &str, name: &str) -> bool {
    code.match_indices(name).any(|(idx, _)| {
        let before = code[..idx].chars().next_back();
        let after = code[idx + name.len()..].chars().next();
        !matches!(before, Some(c) if is_ident_char(c)) && !matches!(after, Some(c) if is_ident_char(c))
    })
}

fn check_python_imports(code: &str, rules: &DenyList) -> Result<(), SafetyViolation> {
    for statement in code.split(|c| matches!(c, '\n' | ';' | ':')) {
        let mut words = statement.split_whitespace();
        let modules: Vec<&str> = match words.next() {
            Some("import") => {
                // import a.b, c as d
                let rest = statement.trim_start().trim_start_matches("import");
                rest.split(',')
                    .filter_map(|part| part.split_whitespace().next())
                    .collect()
            }
            Some("from") => words.next().into_iter().collect(),
            _ => continue,
        };

        for module in modules {
            let root = module.split('.').next().unwrap_or_default();
            if rules.modules.contains(&root) {
                return Err(SafetyViolation::denied(format!("import {}", root)));
            }
        }
    }
    Ok(())
}

/// Reads a quoted string literal at the start of `s`, if there is one.
fn string_literal(s: &str) -> Option<&str> {
    let quote = s.chars().next().filter(|c| matches!(c, '\'' | '"' | '`'))?;
    let body = &s[1..];
    body.find(quote).map(|end| &body[..end])
}

fn js_module_root(specifier: &str) -> &str {
    let bare = specifier.strip_prefix("node:").unwrap_or(specifier);
    bare.split('/').next().unwrap_or(bare)
}

fn check_js_specifier(specifier: &str, rules: &DenyList) -> Result<(), SafetyViolation> {
    let root = js_module_root(specifier);
    if rules.modules.contains(&root) {
        return Err(SafetyViolation::denied(format!("require('{}')", specifier)));
    }
    Ok(())
}

fn check_js_modules(code: &str, rules: &DenyList) -> Result<(), SafetyViolation> {
    // require(...) and import(...): only literal specifiers can be checked
    for loader in ["require", "import"] {
        for (idx, _) in code.match_indices(loader) {
            if preceded_by_ident_or_dot(code, idx) {
                continue;
            }
            let rest = code[idx + loader.len()..].trim_start();
            let Some(args) = rest.strip_prefix('(') else {
                continue;
            };
            match string_literal(args.trim_start()) {
                Some(specifier) => check_js_specifier(specifier, rules)?,
                None => return Err(SafetyViolation::denied(format!("{}(", loader))),
            }
        }
    }

    // import x from 'fs' / import 'fs' / export * from 'fs'
    for keyword in ["from", "import"] {
        for (idx, _) in code.match_indices(keyword) {
            if preceded_by_ident_or_dot(code, idx) {
                continue;
            }
            let rest = &code[idx + keyword.len()..];
            if rest.starts_with(is_ident_char) {
                continue;
            }
            if let Some(specifier) = string_literal(rest.trim_start()) {
                check_js_specifier(specifier, rules)?;
            }
        }
    }

    Ok(())
}

fn check_cpp_includes(code: &str, rules: &DenyList) -> Result<(), SafetyViolation> {
    for line in code.lines() {
        let Some(directive) = line.trim_start().strip_prefix('#') else {
            continue;
        };
        let Some(target) = directive.trim_start().strip_prefix("include") else {
            continue;
        };
        let target = target.trim();
        let header = target
            .strip_prefix('<')
            .and_then(|t| t.split('>').next())
            .or_else(|| target.strip_prefix('"').and_then(|t| t.split('"').next()))
            .map(str::trim);

        if let Some(header) = header {
            if rules.modules.contains(&header) {
                return Err(SafetyViolation::denied(format!("#include <{}>", header)));
            }
        }
    }
    Ok(())
}
