//! S-expression surface of the rewrite-rule language.

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Atom(String),
    List(Vec<Expr>),
}

impl Expr {
    pub fn as_atom(&self) -> &str {
        match self {
            Expr::Atom(s) => s,
            Expr::List(_) => panic!("expected an atom, got a list"),
        }
    }

    pub fn head(&self) -> Option<&str> {
        match self {
            Expr::List(items) => match items.first() {
                Some(Expr::Atom(s)) => Some(s),
                _ => None,
            },
            Expr::Atom(_) => None,
        }
    }
}

struct Tokens<'a> {
    text: &'a str,
    loc: usize,
}

impl<'a> Tokens<'a> {
    fn next(&mut self) -> &'a str {
        let bytes = self.text.as_bytes();
        while self.loc < bytes.len() && bytes[self.loc].is_ascii_whitespace() {
            self.loc += 1;
        }
        if self.loc >= bytes.len() {
            return "";
        }
        if bytes[self.loc] == b'(' || bytes[self.loc] == b')' {
            let tok = &self.text[self.loc..self.loc + 1];
            self.loc += 1;
            return tok;
        }
        let start = self.loc;
        while self.loc < bytes.len()
            && !bytes[self.loc].is_ascii_whitespace()
            && bytes[self.loc] != b'('
            && bytes[self.loc] != b')'
        {
            self.loc += 1;
        }
        &self.text[start..self.loc]
    }

    fn peek_close(&self) -> bool {
        self.text[self.loc..].trim_start().starts_with(')')
    }
}

/// Parses one expression; rules are parsed once at construction so there is
/// no error recovery, a malformed rule is a compiler bug.
pub fn parse(text: &str) -> Expr {
    let mut tokens = Tokens { text, loc: 0 };
    parse_expr(&mut tokens)
}

fn parse_expr(tokens: &mut Tokens) -> Expr {
    let tok = tokens.next();
    assert!(!tok.is_empty(), "unexpected end of rule text");

    if tok == "(" {
        let mut items = Vec::new();
        loop {
            if tokens.peek_close() {
                tokens.next();
                break;
            }
            items.push(parse_expr(tokens));
        }
        Expr::List(items)
    } else {
        Expr::Atom(tok.to_string())
    }
}

pub(crate) fn is_literal(atom: &str) -> bool {
    let bytes = atom.as_bytes();
    !bytes.is_empty() && (bytes[0].is_ascii_digit() || (bytes[0] == b'-' && bytes.len() > 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_lists() {
        let e = parse("(change (add x 'c) (add 'c x))");
        match e {
            Expr::List(items) => {
                assert_eq!(items.len(), 3);
                assert_eq!(items[0], Expr::Atom("change".into()));
                assert_eq!(items[1].head(), Some("add"));
            }
            _ => panic!("expected a list"),
        }
    }

    #[test]
    fn parses_bare_atom() {
        assert_eq!(parse("x"), Expr::Atom("x".into()));
    }
}
