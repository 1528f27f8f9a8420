//! `${VAR}` templates for wrapper scripts.
//!
//! Only `${NAME}` is a placeholder. `$$` emits a single `$`; any other `$`
//! is literal, so shell expressions like `$?` and `$result` pass through.

use std::collections::HashMap;

use crate::error::{ExecError, Result};

/// Wrapper run by every backend. The exit-code write is the last statement
/// and goes through a temp file plus `mv`, so readers never see a partial
/// value under a final name.
pub const WRAPPER_TEMPLATE: &str = r#"#!/bin/sh
${DIRECTIVES}
cd ${WORKDIR}
result=$?
if [ $result -eq 0 ]; then
(
${COMMAND}
) > ${STDOUT} 2> ${STDERR}
result=$?
fi
printf '%s\n' "$result" > ${EXIT_TMP}
mv -f ${EXIT_TMP} ${EXIT_FILE}
exit $result
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Lit(String),
    Var(String),
}

#[derive(Debug, Clone, Default)]
pub struct Template(Vec<Segment>);

impl Template {
    pub fn parse(input: &str) -> Result<Self> {
        let mut segs = Vec::new();
        let mut lit = String::new();
        let mut chars = input.char_indices().peekable();

        while let Some((i, ch)) = chars.next() {
            if ch != '$' {
                lit.push(ch);
                continue;
            }
            match chars.peek().map(|(_, c)| *c) {
                Some('$') => {
                    chars.next();
                    lit.push('$');
                }
                Some('{') => {
                    chars.next();
                    let start = i + 2;
                    let end = input[start..].find('}').map(|off| start + off).ok_or_else(|| {
                        ExecError::Configuration("unclosed ${ in template".to_string())
                    })?;
                    let var = &input[start..end];
                    if var.is_empty()
                        || !var.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                    {
                        return Err(ExecError::Configuration(format!(
                            "invalid template variable '{}'",
                            var
                        )));
                    }
                    if !lit.is_empty() {
                        segs.push(Segment::Lit(std::mem::take(&mut lit)));
                    }
                    segs.push(Segment::Var(var.to_string()));
                    while let Some((j, _)) = chars.peek() {
                        if *j > end {
                            break;
                        }
                        chars.next();
                    }
                }
                _ => lit.push('$'),
            }
        }
        if !lit.is_empty() {
            segs.push(Segment::Lit(lit));
        }
        Ok(Template(segs))
    }

    /// Substitute every placeholder. A placeholder with no value is an error
    /// rather than an empty string, so a typo cannot drop the user command.
    pub fn render(&self, vars: &HashMap<&str, String>) -> Result<String> {
        let mut out = String::new();
        for seg in &self.0 {
            match seg {
                Segment::Lit(s) => out.push_str(s),
                Segment::Var(k) => match vars.get(k.as_str()) {
                    Some(v) => out.push_str(v),
                    None => {
                        return Err(ExecError::Configuration(format!(
                            "no value for template variable '{}'",
                            k
                        )))
                    }
                },
            }
        }
        Ok(out)
    }
}

/// Quote a value for safe interpolation into a POSIX shell script.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
