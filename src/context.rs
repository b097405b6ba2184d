/// Per-terminal session state. Never part of the persisted cluster.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Where simulators take "now" from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Clock {
    System,
    Fixed(DateTime<Utc>),
}

#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Node the operator is logged into
    pub current_node: String,
    pub cwd: String,
    pub env: BTreeMap<String, String>,
    pub history: Vec<String>,
    pub user: String,
    pub clock: Clock,
    /// Nodes left behind by `ssh`, innermost last
    pub hops: Vec<String>,
    /// Set when `exit` is run on the login node
    pub exited: bool,
}

impl CommandContext {
    pub fn new(node: &str) -> Self {
        let mut env = BTreeMap::new();
        env.insert("HOME".to_string(), "/root".to_string());
        env.insert("USER".to_string(), "root".to_string());
        env.insert("SHELL".to_string(), "/bin/bash".to_string());
        env.insert("PATH".to_string(), "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string());
        env.insert("CUDA_HOME".to_string(), "/usr/local/cuda".to_string());
        env.insert("HOSTNAME".to_string(), node.to_string());
        CommandContext {
            current_node: node.to_string(),
            cwd: "/root".to_string(),
            env,
            history: Vec::new(),
            user: "root".to_string(),
            clock: Clock::System,
            hops: Vec::new(),
            exited: false,
        }
    }

    /// A context whose clock never moves, for reproducible output.
    pub fn with_fixed_clock(node: &str, at: DateTime<Utc>) -> Self {
        CommandContext { clock: Clock::Fixed(at), ..Self::new(node) }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self.clock {
            Clock::System => Utc::now(),
            Clock::Fixed(t) => t,
        }
    }

    /// Shell prompt, e.g. `root@dgx-00:~# `.
    pub fn prompt(&self) -> String {
        let dir = if self.cwd == "/root" { "~" } else { self.cwd.as_str() };
        format!("{}@{}:{}# ", self.user, self.current_node, dir)
    }

    /// Move the session to `node`, remembering where it came from.
    pub fn enter(&mut self, node: &str) {
        let from = std::mem::replace(&mut self.current_node, node.to_string());
        self.hops.push(from);
        self.cwd = "/root".to_string();
        self.env.insert("HOSTNAME".to_string(), node.to_string());
    }

    /// Return to the previous node. `None` on the login node.
    pub fn leave(&mut self) -> Option<String> {
        let back = self.hops.pop()?;
        let left = std::mem::replace(&mut self.current_node, back);
        self.cwd = "/root".to_string();
        self.env.insert("HOSTNAME".to_string(), self.current_node.clone());
        Some(left)
    }

    /// Expand `$VAR` and `${VAR}` from the session environment.
    pub fn expand(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            let braced = chars.peek() == Some(&'{');
            if braced {
                chars.next();
            }
            let mut name = String::new();
            while let Some(&n) = chars.peek() {
                if n.is_ascii_alphanumeric() || n == '_' {
                    name.push(n);
                    chars.next();
                } else {
                    break;
                }
            }
            let closed = braced && chars.peek() == Some(&'}');
            if closed {
                chars.next();
            }
            // `$`, `${}` and an unterminated `${NAME` stay literal
            if name.is_empty() || braced != closed {
                out.push('$');
                if braced {
                    out.push('{');
                }
                out.push_str(&name);
                if closed {
                    out.push('}');
                }
            } else if let Some(v) = self.env.get(&name) {
                out.push_str(v);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_variables() {
        let ctx = CommandContext::new("dgx-02");
        assert_eq!(ctx.expand("host=$HOSTNAME home=${HOME} x=$NOPE $"), "host=dgx-02 home=/root x= $");
    }

    #[test]
    fn malformed_references_stay_literal() {
        let ctx = CommandContext::new("dgx-02");
        assert_eq!(ctx.expand("echo ${}"), "echo ${}");
        assert_eq!(ctx.expand("a${}b"), "a${}b");
        assert_eq!(ctx.expand("${HOME"), "${HOME");
        assert_eq!(ctx.expand("${HOME}/x"), "/root/x");
    }

    #[test]
    fn ssh_hops_unwind_in_order() {
        let mut ctx = CommandContext::new("dgx-00");
        ctx.enter("dgx-03");
        ctx.enter("dgx-05");
        assert_eq!(ctx.expand("$HOSTNAME"), "dgx-05");
        assert_eq!(ctx.leave().as_deref(), Some("dgx-05"));
        assert_eq!(ctx.leave().as_deref(), Some("dgx-03"));
        assert_eq!(ctx.current_node, "dgx-00");
        assert_eq!(ctx.leave(), None);
    }

    #[test]
    fn prompt_abbreviates_home() {
        let mut ctx = CommandContext::new("dgx-00");
        assert_eq!(ctx.prompt(), "root@dgx-00:~# ");
        ctx.cwd = "/raid".into();
        assert_eq!(ctx.prompt(), "root@dgx-00:/raid# ");
    }
}
