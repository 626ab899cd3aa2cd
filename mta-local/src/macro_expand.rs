//! Command-line macro expansion for pipe delivery (spec §4.7.2): each
//! `argv` element is scanned for `$name`, `${name}`, `$(name)` references to
//! a fixed macro set. A small hand-rolled scanner, grounded in
//! `smtp-message`'s own hand-written parsers -- the grammar here is a
//! trivial three-form substitution, not worth a parser-combinator
//! dependency.

use std::collections::HashMap;

/// The fixed macro set (spec §4.7.2).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Macro {
    Sender,
    NextHop,
    Recipient,
    User,
    Extension,
    Mailbox,
}

impl Macro {
    fn from_name(name: &str) -> Option<Macro> {
        match name {
            "sender" => Some(Macro::Sender),
            "nexthop" => Some(Macro::NextHop),
            "recipient" => Some(Macro::Recipient),
            "user" => Some(Macro::User),
            "extension" => Some(Macro::Extension),
            "mailbox" => Some(Macro::Mailbox),
            _ => None,
        }
    }

    /// Recipient-dependent macros cause the argument they appear in to be
    /// expanded once per recipient (spec §4.7.2); the rest expand exactly
    /// once for the whole command line.
    pub fn is_recipient_dependent(self) -> bool {
        matches!(
            self,
            Macro::Recipient | Macro::User | Macro::Extension | Macro::Mailbox
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MacroError {
    #[error("unterminated macro reference in ‘{0}’")]
    Unterminated(String),
    #[error("unknown macro name ‘{0}’")]
    UnknownMacro(String),
}

/// One argv element, split into a literal/macro token sequence.
#[derive(Clone, Debug, Eq, PartialEq)]
enum Token {
    Literal(String),
    Macro(Macro),
}

fn tokenize(arg: &str) -> Result<Vec<Token>, MacroError> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = arg.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            literal.push(c);
            continue;
        }
        let (closing, name) = match chars.peek().copied() {
            Some((_, '{')) => {
                chars.next();
                (Some('}'), read_until(&mut chars, '}'))
            }
            Some((_, '(')) => {
                chars.next();
                (Some(')'), read_until(&mut chars, ')'))
            }
            _ => (None, read_bare_name(&mut chars)),
        };
        let name = name.ok_or_else(|| MacroError::Unterminated(arg.to_owned()))?;
        if closing.is_some() {
            // read_until already consumed the closing delimiter; nothing
            // further to check here.
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(std::mem::take(&mut literal)));
        }
        let m = Macro::from_name(&name).ok_or_else(|| MacroError::UnknownMacro(name.clone()))?;
        tokens.push(Token::Macro(m));
    }
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

fn read_until(
    chars: &mut std::iter::Peekable<std::str::CharIndices>,
    closing: char,
) -> Option<String> {
    let mut name = String::new();
    for (_, c) in chars.by_ref() {
        if c == closing {
            return Some(name);
        }
        name.push(c);
    }
    None
}

fn read_bare_name(chars: &mut std::iter::Peekable<std::str::CharIndices>) -> Option<String> {
    let mut name = String::new();
    while let Some(&(_, c)) = chars.peek() {
        if c.is_ascii_alphanumeric() || c == '_' {
            name.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn whether_recipient_dependent(tokens: &[Token]) -> bool {
    tokens.iter().any(|t| matches!(t, Token::Macro(m) if m.is_recipient_dependent()))
}

fn render(tokens: &[Token], values: &HashMap<Macro, &str>) -> Option<String> {
    let mut out = String::new();
    for token in tokens {
        match token {
            Token::Literal(s) => out.push_str(s),
            Token::Macro(m) => {
                let value = values.get(m).copied().unwrap_or("");
                if value.is_empty() && matches!(m, Macro::User) {
                    // Spec: "a blank user component causes that argument to
                    // be omitted (supports catch-all delivery conventions)".
                    return None;
                }
                out.push_str(value);
            }
        }
    }
    Some(out)
}

/// One recipient's macro values, already split on the configured recipient
/// delimiter into user/extension.
pub struct RecipientMacros<'a> {
    pub recipient: &'a str,
    pub user: &'a str,
    pub extension: &'a str,
    pub mailbox: &'a str,
}

/// Expands one argv element: if it contains no recipient-dependent macro,
/// returns a single resolved argument; otherwise returns one resolved
/// argument per recipient (omitting any whose `user` component renders
/// empty, per spec).
pub fn expand_argv_element(
    arg: &str,
    sender: &str,
    nexthop: &str,
    recipients: &[RecipientMacros],
) -> Result<Vec<String>, MacroError> {
    let tokens = tokenize(arg)?;
    if !whether_recipient_dependent(&tokens) {
        let mut values = HashMap::new();
        values.insert(Macro::Sender, sender);
        values.insert(Macro::NextHop, nexthop);
        return Ok(render(&tokens, &values).into_iter().collect());
    }

    let mut out = Vec::with_capacity(recipients.len());
    for r in recipients {
        let mut values = HashMap::new();
        values.insert(Macro::Sender, sender);
        values.insert(Macro::NextHop, nexthop);
        values.insert(Macro::Recipient, r.recipient);
        values.insert(Macro::User, r.user);
        values.insert(Macro::Extension, r.extension);
        values.insert(Macro::Mailbox, r.mailbox);
        if let Some(rendered) = render(&tokens, &values) {
            out.push(rendered);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_recipient_argument_expands_once() {
        let recipients = [];
        let out = expand_argv_element("$sender@$nexthop", "a@x", "y", &recipients).unwrap();
        assert_eq!(out, vec!["a@x@y"]);
    }

    #[test]
    fn recipient_dependent_argument_expands_per_recipient() {
        let recipients = [
            RecipientMacros {
                recipient: "alice@x",
                user: "alice",
                extension: "",
                mailbox: "alice",
            },
            RecipientMacros {
                recipient: "bob@x",
                user: "bob",
                extension: "",
                mailbox: "bob",
            },
        ];
        let out = expand_argv_element("${recipient}", "s@x", "y", &recipients).unwrap();
        assert_eq!(out, vec!["alice@x", "bob@x"]);
    }

    #[test]
    fn blank_user_component_omits_the_argument() {
        let recipients = [RecipientMacros {
            recipient: "postmaster@x",
            user: "",
            extension: "",
            mailbox: "",
        }];
        let out = expand_argv_element("$(user)", "s@x", "y", &recipients).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn unknown_macro_errors() {
        assert!(expand_argv_element("$bogus", "s", "n", &[]).is_err());
    }

    #[test]
    fn unterminated_brace_errors() {
        assert!(expand_argv_element("${sender", "s", "n", &[]).is_err());
    }
}
