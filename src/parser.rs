/// Command-line parser.
///
/// Produces a [`ParsedCommand`] from one line of operator input. Flags keep
/// the exact syntax they were written in (`-d ECC`, `-dECC`, `--display=ECC`)
/// so a simulator can reject near-miss spellings the way the real tool does.
///
/// No shell features: pipes, redirection, command chaining and globbing are
/// rejected rather than silently ignored.
use crate::error::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagStyle {
    /// `-x` or `-xyz`
    Short,
    /// `--name`
    Long,
    /// `--name=value`
    LongEq,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flag {
    /// Name without leading dashes, exactly as typed ("d", "dECC", "query-gpu")
    pub name: String,
    pub value: Option<String>,
    pub style: FlagStyle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub base: String,
    /// First operand (verb for multi-verb tools)
    pub subcommand: Option<String>,
    /// Flags in the order they appeared
    pub flags: Vec<Flag>,
    /// Operands after the subcommand
    pub positionals: Vec<String>,
    pub raw: String,
}

impl ParsedCommand {
    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.iter().any(|f| f.name == name)
    }

    /// True when any of `names` is present (e.g. `["h", "help"]`).
    pub fn has_any(&self, names: &[&str]) -> bool {
        names.iter().any(|n| self.has_flag(n))
    }

    pub fn flag(&self, name: &str) -> Option<&Flag> {
        self.flags.iter().find(|f| f.name == name)
    }

    /// Value of the first of `names` that carries one.
    pub fn flag_value(&self, names: &[&str]) -> Option<&str> {
        self.flags
            .iter()
            .filter(|f| names.contains(&f.name.as_str()))
            .find_map(|f| f.value.as_deref())
    }

    /// Value for a short option that also accepts the attached form
    /// (`-N 2` or `-N2`), as Slurm and ipmitool do.
    pub fn short_value(&self, c: char) -> Option<&str> {
        self.flags.iter().find_map(|f| {
            if f.style != FlagStyle::Short {
                return None;
            }
            let mut chars = f.name.chars();
            if chars.next() != Some(c) {
                return None;
            }
            let rest = chars.as_str();
            if rest.is_empty() { f.value.as_deref() } else { Some(rest) }
        })
    }

    /// All operands, subcommand first.
    pub fn operands(&self) -> Vec<&str> {
        self.subcommand
            .iter()
            .map(|s| s.as_str())
            .chain(self.positionals.iter().map(|s| s.as_str()))
            .collect()
    }

    /// Flags whose name is not in `known`.
    pub fn unknown_flags<'a>(&'a self, known: &[&str]) -> Vec<&'a Flag> {
        self.flags.iter().filter(|f| !known.contains(&f.name.as_str())).collect()
    }

    /// Text after the base command, as typed.
    pub fn args_text(&self) -> &str {
        self.raw.trim_start().get(self.base.len()..).unwrap_or("").trim()
    }
}

/// Per-tool hints the generic parser needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagGrammar {
    /// Flags that never take a value
    pub boolean: &'static [&'static str],
    /// After this many operands every remaining token is an operand
    /// (`srun ... <cmd> <args>`, `docker run ... <image> <cmd>`)
    pub passthrough_after: Option<usize>,
}

/// Grammar hints for the commands the router knows.
pub fn grammar_for(base: &str) -> FlagGrammar {
    let boolean: &'static [&'static str] = match base {
        "nvidia-smi" => &["q", "L", "h", "help", "m", "s", "e", "a", "c", "r", "query", "list-gpus"],
        "dcgmi" => &["l", "c", "h", "help", "version", "v", "j"],
        "nv-fabricmanager" => &["version", "v", "h", "help"],
        "sinfo" => &["N", "l", "R", "s", "h", "long", "Node", "list-reasons", "summarize", "noheader"],
        "squeue" => &["l", "h", "long", "noheader", "a", "all"],
        "sacct" => &["a", "allusers", "X", "n", "noheader", "l", "long"],
        "scontrol" => &["h", "help", "v", "d", "details", "oneliner", "o"],
        "sbatch" | "scancel" => &["h", "help", "v", "verbose", "parsable", "Q", "quiet"],
        "srun" => &["l", "label", "pty", "exclusive"],
        "ipmitool" => &["v", "h", "c"],
        "ibstat" => &["l", "s", "p", "d", "list_of_cas", "short", "port_list", "h"],
        "perfquery" => &["x", "extended", "a", "all_ports", "r", "reset_after_read", "h"],
        "iblinkinfo" | "ibnetdiscover" | "ibdiagnet" | "sminfo" | "ibstatus" => &["h", "l", "p", "v", "switches-only", "line"],
        "mlxlink" => &["c", "e", "m", "h", "show_module", "show_counters"],
        "mlxfwmanager" => &["query", "h", "online"],
        "uname" => &["a", "r", "n", "m", "s", "o", "all"],
        "free" => &["g", "m", "h", "k", "t", "w", "human", "giga"],
        "df" => &["h", "H", "T", "i", "l", "human-readable"],
        "lspci" => &["v", "vv", "vvv", "nn", "n", "t", "k", "D"],
        "dmesg" => &["T", "H", "w", "k", "ctime", "human"],
        "journalctl" => &["k", "b", "f", "x", "e", "r", "no-pager", "dmesg"],
        "docker" => &["a", "all", "rm", "it", "i", "t", "d", "detach", "q", "quiet", "no-trunc", "privileged"],
        "enroot" => &["f", "force", "h", "help", "w", "rw", "root"],
        "lfs" => &["h", "v"],
        "nvsm" => &["h", "help", "j", "json"],
        "nvlink-audit" => &["v", "verbose", "h", "help", "json"],
        "nvidia-bug-report.sh" => &["safe-mode", "extra-system-data", "help"],
        "all_reduce_perf" => &["h", "help"],
        "ib_write_bw" => &["h", "help", "report_gbits", "a", "all", "R", "rdma_cm"],
        "gpu_burn" => &["h", "d", "tc"],
        "systemctl" => &["no-pager", "l", "full", "a", "all"],
        "mst" => &["v", "h"],
        "history" | "hostname" | "uptime" | "lscpu" | "nproc" | "whoami" | "pwd" | "date" | "env" => &["a", "h", "p", "s", "u", "all", "short", "f", "i", "J"],
        _ => &[],
    };
    let passthrough_after = match base {
        "srun" | "ssh" => Some(1),
        "docker" | "enroot" => Some(2),
        "echo" => Some(0),
        _ => None,
    };
    FlagGrammar { boolean, passthrough_after }
}

/// Parse one command line using the grammar of its base command.
pub fn parse(raw: &str) -> Result<ParsedCommand, ParseError> {
    let tokens = tokenize(raw)?;
    let base = tokens.first().ok_or(ParseError::Empty)?;
    let grammar = grammar_for(base);
    parse_tokens(raw, tokens, grammar)
}

fn parse_tokens(raw: &str, tokens: Vec<String>, grammar: FlagGrammar) -> Result<ParsedCommand, ParseError> {
    let mut iter = tokens.into_iter();
    let base = iter.next().ok_or(ParseError::Empty)?;
    let rest: Vec<String> = iter.collect();

    let mut cmd = ParsedCommand {
        base,
        subcommand: None,
        flags: Vec::new(),
        positionals: Vec::new(),
        raw: raw.to_string(),
    };

    let mut operands: Vec<String> = Vec::new();
    let mut i = 0;
    let mut literal = false;
    while i < rest.len() {
        let tok = &rest[i];
        i += 1;

        let passthrough = grammar.passthrough_after.is_some_and(|n| operands.len() >= n);
        if literal || passthrough || !looks_like_flag(tok) {
            operands.push(tok.clone());
            continue;
        }
        if tok == "--" {
            literal = true;
            continue;
        }

        let (name, style, inline) = if let Some(long) = tok.strip_prefix("--") {
            match long.split_once('=') {
                Some((n, v)) => (n.to_string(), FlagStyle::LongEq, Some(v.to_string())),
                None => (long.to_string(), FlagStyle::Long, None),
            }
        } else {
            (tok[1..].to_string(), FlagStyle::Short, None)
        };
        if name.is_empty() || name.starts_with('-') {
            return Err(ParseError::InvalidFlag(tok.clone()));
        }

        let value = match inline {
            Some(v) => Some(v),
            None if grammar.boolean.contains(&name.as_str()) => None,
            // attached form (`-N2`) already carries its value
            None if style == FlagStyle::Short && name.chars().count() > 1 => None,
            None => match rest.get(i) {
                Some(next) if !looks_like_flag(next) => {
                    i += 1;
                    Some(next.clone())
                }
                _ => None,
            },
        };
        cmd.flags.push(Flag { name, value, style });
    }

    let mut operands = operands.into_iter();
    cmd.subcommand = operands.next();
    cmd.positionals = operands.collect();
    Ok(cmd)
}

fn looks_like_flag(tok: &str) -> bool {
    tok.len() > 1 && tok.starts_with('-') && !tok[1..].starts_with(|c: char| c.is_ascii_digit())
}

/// Split a line into words, honouring single quotes, double quotes and
/// backslash escapes.
pub fn tokenize(raw: &str) -> Result<Vec<String>, ParseError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                in_token = true;
                let quote = c;
                loop {
                    match chars.next() {
                        Some(q) if q == quote => break,
                        Some('\\') if quote == '"' => match chars.next() {
                            Some(e) => current.push(e),
                            None => return Err(ParseError::UnterminatedQuote(quote)),
                        },
                        Some(other) => current.push(other),
                        None => return Err(ParseError::UnterminatedQuote(quote)),
                    }
                }
            }
            '\\' => {
                in_token = true;
                if let Some(e) = chars.next() {
                    current.push(e);
                }
            }
            '|' | '>' | '<' | ';' | '&' | '`' => {
                let mut op = c.to_string();
                if let Some(&next) = chars.peek() {
                    if next == c {
                        op.push(next);
                    }
                }
                return Err(ParseError::UnsupportedOperator(op));
            }
            '$' if chars.peek() == Some(&'(') => {
                return Err(ParseError::UnsupportedOperator("$(".to_string()));
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            other => {
                in_token = true;
                current.push(other);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(tokens)
}
