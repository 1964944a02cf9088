//! Restore-format rule buffers.
//!
//! A [`RuleSet`] holds one [`TableRules`] per table, each split into a
//! declarations section and a rules section. Buffers are reset, not
//! reallocated, between passes.

use crate::existing::ExistingChains;
use crate::iptables::Table;

/// Newline-terminated lines of space-separated words.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    lines: usize,
}

impl LineBuffer {
    pub fn write_line<S: AsRef<str>>(&mut self, words: &[S]) {
        for (i, word) in words.iter().enumerate() {
            if i > 0 {
                self.buf.push(b' ');
            }
            self.buf.extend_from_slice(word.as_ref().as_bytes());
        }
        self.buf.push(b'\n');
        self.lines += 1;
    }

    /// Write a line that is already formatted, e.g. a saved declaration.
    pub fn write_raw_line(&mut self, line: &str) {
        self.buf.extend_from_slice(line.as_bytes());
        self.buf.push(b'\n');
        self.lines += 1;
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.lines = 0;
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Arguments of one rule, built fluently and finished with a jump target.
#[derive(Debug, Clone, Default)]
pub struct RuleArgs(Vec<String>);

impl RuleArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.0.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.extend(args.into_iter().map(Into::into));
        self
    }

    /// `-m comment --comment "<text>"`. The quotes are part of the restore text.
    pub fn comment(self, text: &str) -> Self {
        self.args(["-m", "comment", "--comment"])
            .arg(format!("\"{}\"", text))
    }

    /// `-m comment --comment <text>` for rules passed as argv, where nothing
    /// strips quotes.
    pub fn comment_arg(self, text: &str) -> Self {
        self.args(["-m", "comment", "--comment", text])
    }

    /// `-m <proto> -p <proto>`.
    pub fn protocol(self, protocol: &str) -> Self {
        self.args(["-m", protocol, "-p", protocol])
    }

    pub fn jump(self, target: &str) -> Vec<String> {
        self.arg("-j").arg(target).0
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

/// Declarations and rules for one table.
#[derive(Debug)]
pub struct TableRules {
    table: Table,
    chains: LineBuffer,
    rules: LineBuffer,
}

impl TableRules {
    pub fn new(table: Table) -> Self {
        let mut rules = Self {
            table,
            chains: LineBuffer::default(),
            rules: LineBuffer::default(),
        };
        rules.reset();
        rules
    }

    /// Clear both sections and write the table header.
    pub fn reset(&mut self) {
        self.chains.reset();
        self.rules.reset();
        self.chains.write_raw_line(&format!("*{}", self.table));
    }

    /// Declare `chain`, reusing the installed declaration line (and its
    /// counters) when there is one. Returns true if the line was reused.
    pub fn declare_chain(&mut self, chain: &str, existing: &ExistingChains) -> bool {
        match existing.get(chain) {
            Some(line) => {
                self.chains.write_raw_line(line);
                true
            }
            None => {
                self.chains.write_raw_line(&format!(":{} - [0:0]", chain));
                false
            }
        }
    }

    /// Append `-A chain args...`.
    pub fn append<S: AsRef<str>>(&mut self, chain: &str, args: &[S]) {
        let mut words: Vec<&str> = Vec::with_capacity(args.len() + 2);
        words.push("-A");
        words.push(chain);
        words.extend(args.iter().map(AsRef::as_ref));
        self.rules.write_line(&words);
    }

    /// Delete `chain`. Must follow a declaration of the same chain, which flushes it.
    pub fn delete_chain(&mut self, chain: &str) {
        self.rules.write_line(&["-X", chain]);
    }

    /// Close the table.
    pub fn commit(&mut self) {
        self.rules.write_raw_line("COMMIT");
    }

    /// Number of declaration lines, header excluded.
    pub fn chain_count(&self) -> usize {
        self.chains.lines().saturating_sub(1)
    }

    /// Number of rule lines, commit marker included.
    pub fn rule_count(&self) -> usize {
        self.rules.lines()
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.chains.as_bytes());
        out.extend_from_slice(self.rules.as_bytes());
    }
}

/// The complete output of one pass: `filter` then `nat`.
#[derive(Debug)]
pub struct RuleSet {
    pub filter: TableRules,
    pub nat: TableRules,
    data: Vec<u8>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleSet {
    pub fn new() -> Self {
        Self {
            filter: TableRules::new(Table::Filter),
            nat: TableRules::new(Table::Nat),
            data: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.filter.reset();
        self.nat.reset();
        self.data.clear();
    }

    /// Concatenate both tables into one restore payload.
    pub fn serialize(&mut self) -> &[u8] {
        self.data.clear();
        self.filter.write_to(&mut self.data);
        self.nat.write_to(&mut self.data);
        &self.data
    }
}
