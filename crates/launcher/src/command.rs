//! Pure assembly of shell command lines. Nothing here touches a process.

/// Accumulates space-separated tokens of one shell invocation.
///
/// Empty tokens are skipped, so an unset option string never leaves a
/// double space behind. The remote payload is wrapped in double quotes with
/// `\`, `"`, `$` and `` ` `` escaped, which hands it to the remote shell
/// verbatim instead of letting the local shell expand it first.
#[derive(Clone, Debug, Default)]
pub struct CommandBuilder {
    parts: Vec<String>,
}

impl CommandBuilder {
    pub fn new(program: &str) -> Self {
        let mut builder = Self::default();
        builder.push(program);
        builder
    }

    /// Appends a raw token (or pre-formed flag string) as is.
    pub fn token(mut self, token: &str) -> Self {
        self.push(token);
        self
    }

    /// Appends a local or `host:path` operand, quoting it only when needed.
    pub fn path(mut self, path: &str) -> Self {
        if !path.is_empty() {
            self.parts.push(quote_path(path));
        }
        self
    }

    /// Appends the remote payload in double quotes.
    pub fn payload(mut self, payload: &str) -> Self {
        if !payload.is_empty() {
            self.parts.push(quote_payload(payload));
        }
        self
    }

    pub fn build(self) -> String {
        self.parts.join(" ")
    }

    fn push(&mut self, token: &str) {
        let token = token.trim();
        if !token.is_empty() {
            self.parts.push(token.to_string());
        }
    }
}

/// `<binary> <options> <host> "<payload>"`
pub(crate) fn remote_command(binary: &str, options: &str, host: &str, payload: &str) -> String {
    CommandBuilder::new(binary)
        .token(options)
        .token(host)
        .payload(payload)
        .build()
}

/// `<binary> <options> <source> <destination>`
pub(crate) fn copy_command(
    binary: &str,
    options: &str,
    source: &str,
    destination: &str,
) -> String {
    CommandBuilder::new(binary)
        .token(options)
        .path(source)
        .path(destination)
        .build()
}

pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn quote_payload(payload: &str) -> String {
    let mut quoted = String::with_capacity(payload.len() + 2);
    quoted.push('"');
    for ch in payload.chars() {
        if matches!(ch, '\\' | '"' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

fn quote_path(path: &str) -> String {
    let safe = path
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || "-_./:@~+=,%".contains(ch));
    if safe {
        path.to_string()
    } else {
        shell_words::quote(path).into_owned()
    }
}
