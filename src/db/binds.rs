//! Bind token scanning.
//!
//! Splits SQL text into plain text and bind tokens:
//!
//! - `:name` and `:{a.b}` named input binds
//! - `?` positional binds
//! - `::fn(arg, ...)` custom bind functions
//! - `INTO :a, :b` output binds (the clause is removed from the statement)
//!
//! Quoted literals, quoted identifiers and comments are copied verbatim.
//! `::type` casts without an argument list and `:=` are left untouched.

use crate::error::{SqlError, SqlResult};

/// Argument of a custom bind function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionArg {
    /// `:name` reference to a bind value.
    Bind(String),
    /// `'quoted'` literal, unquoted.
    Literal(String),
    /// Bare word such as a descriptor name.
    Name(String),
}

impl FunctionArg {
    /// The raw text of the argument for error messages.
    pub fn text(&self) -> &str {
        match self {
            Self::Bind(s) | Self::Literal(s) | Self::Name(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Text(String),
    Named(String),
    Positional,
    Function { name: String, args: Vec<FunctionArg> },
}

/// SQL text split into tokens, plus the output binds of an `INTO` clause.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedStatement {
    pub tokens: Vec<Token>,
    pub outputs: Vec<String>,
}

impl ParsedStatement {
    /// Names of the named input binds, in order of appearance.
    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().filter_map(|t| match t {
            Token::Named(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn functions(&self) -> impl Iterator<Item = (&str, &[FunctionArg])> {
        self.tokens.iter().filter_map(|t| match t {
            Token::Function { name, args } => Some((name.as_str(), args.as_slice())),
            _ => None,
        })
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '#'
}

struct Scanner<'a> {
    chars: Vec<char>,
    pos: usize,
    sql: &'a str,
    text: String,
    out: ParsedStatement,
}

impl<'a> Scanner<'a> {
    fn new(sql: &'a str) -> Self {
        Self {
            chars: sql.chars().collect(),
            pos: 0,
            sql,
            text: String::new(),
            out: ParsedStatement::default(),
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn flush_text(&mut self) {
        if !self.text.is_empty() {
            self.out.tokens.push(Token::Text(std::mem::take(&mut self.text)));
        }
    }

    fn push_token(&mut self, token: Token) {
        self.flush_text();
        self.out.tokens.push(token);
    }

    fn error(&self, message: impl std::fmt::Display) -> SqlError {
        SqlError::processing(format!("{} at offset {}", message, self.pos))
            .with_context(format!("statement={}", self.sql))
    }

    /// Copy a quoted section, including both delimiters.
    fn copy_quoted(&mut self, quote: char) {
        self.text.push(quote);
        self.pos += 1;
        while let Some(c) = self.peek(0) {
            self.text.push(c);
            self.pos += 1;
            if c == quote {
                return;
            }
        }
    }

    fn copy_until(&mut self, end: &str) {
        let end: Vec<char> = end.chars().collect();
        while self.pos < self.chars.len() {
            if self.chars[self.pos..].starts_with(&end) {
                self.text.extend(end.iter());
                self.pos += end.len();
                return;
            }
            self.text.push(self.chars[self.pos]);
            self.pos += 1;
        }
    }

    fn read_ident(&mut self) -> String {
        let start = self.pos;
        while self.peek(0).is_some_and(is_ident_char) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    /// Read a bind name after the colon: `name` or `{path}`.
    fn read_bind_name(&mut self) -> SqlResult<Option<String>> {
        match self.peek(0) {
            Some('{') => {
                self.pos += 1;
                let start = self.pos;
                while self.peek(0).is_some_and(|c| c != '}') {
                    self.pos += 1;
                }
                if self.peek(0).is_none() {
                    return Err(self.error("Unterminated bind ':{'"));
                }
                let name: String = self.chars[start..self.pos].iter().collect();
                self.pos += 1;
                let name = name.trim().to_string();
                if name.is_empty() {
                    return Err(self.error("Empty bind name"));
                }
                Ok(Some(name))
            }
            Some(c) if is_ident_start(c) => Ok(Some(self.read_ident())),
            _ => Ok(None),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek(0).is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    /// Parse `::name(args)` starting at the first colon. Returns `false` and
    /// leaves the position unchanged when this is not a function call.
    fn try_function(&mut self) -> SqlResult<bool> {
        let start = self.pos;
        self.pos += 2;
        if !self.peek(0).is_some_and(is_ident_start) {
            self.pos = start;
            return Ok(false);
        }
        let name = self.read_ident();
        self.skip_whitespace();
        if self.peek(0) != Some('(') {
            self.pos = start;
            return Ok(false);
        }
        self.pos += 1;

        let mut args = Vec::new();
        let mut current = String::new();
        let mut quoted = false;
        loop {
            let Some(c) = self.peek(0) else {
                return Err(self.error(format!("Unterminated function '::{}('", name)));
            };
            self.pos += 1;
            match c {
                '\'' => {
                    quoted = !quoted;
                    current.push(c);
                }
                ',' | ')' if !quoted => {
                    let arg = current.trim();
                    if !arg.is_empty() {
                        args.push(parse_arg(arg));
                    } else if c == ',' || !args.is_empty() {
                        return Err(self.error(format!("Empty argument in '::{}'", name)));
                    }
                    current.clear();
                    if c == ')' {
                        break;
                    }
                }
                _ => current.push(c),
            }
        }
        self.push_token(Token::Function {
            name: name.to_lowercase(),
            args,
        });
        Ok(true)
    }

    /// Parse `INTO :a, :b`. Returns `false` and leaves the position unchanged
    /// when the keyword is not followed by a bind.
    fn try_into_clause(&mut self) -> SqlResult<bool> {
        let start = self.pos;
        self.pos += 4;
        self.skip_whitespace();
        if self.peek(0) != Some(':') || self.peek(1) == Some(':') {
            self.pos = start;
            return Ok(false);
        }

        let mut outputs = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek(0) != Some(':') {
                return Err(self.error("Expected output bind after INTO"));
            }
            self.pos += 1;
            match self.read_bind_name()? {
                Some(name) => outputs.push(name),
                None => return Err(self.error("Expected output bind after INTO")),
            }
            let before_comma = self.pos;
            self.skip_whitespace();
            if self.peek(0) == Some(',') && self.peek_after_comma_is_bind() {
                self.pos += 1;
            } else {
                self.pos = before_comma;
                break;
            }
        }
        self.out.outputs.extend(outputs);
        Ok(true)
    }

    fn peek_after_comma_is_bind(&self) -> bool {
        let mut i = self.pos + 1;
        while self.chars.get(i).is_some_and(|c| c.is_whitespace()) {
            i += 1;
        }
        self.chars.get(i) == Some(&':') && self.chars.get(i + 1) != Some(&':')
    }

    /// Whether the previous character ends an expression, making `::` a cast.
    fn follows_expression(&self) -> bool {
        self.pos > 0
            && matches!(self.chars[self.pos - 1], c if is_ident_char(c) || matches!(c, ')' | ']' | '\'' | '"'))
    }

    fn at_keyword_into(&self) -> bool {
        let word_start = self.pos == 0 || !is_ident_char(self.chars[self.pos - 1]);
        let matches = self
            .chars
            .get(self.pos..self.pos + 4)
            .is_some_and(|w| w.iter().collect::<String>().eq_ignore_ascii_case("into"));
        let word_end = !self.peek(4).is_some_and(is_ident_char);
        word_start && matches && word_end
    }

    fn run(mut self) -> SqlResult<ParsedStatement> {
        while let Some(c) = self.peek(0) {
            match c {
                '\'' | '"' => self.copy_quoted(c),
                '-' if self.peek(1) == Some('-') => self.copy_until("\n"),
                '/' if self.peek(1) == Some('*') => {
                    self.text.push_str("/*");
                    self.pos += 2;
                    self.copy_until("*/");
                }
                '?' => {
                    self.pos += 1;
                    self.push_token(Token::Positional);
                }
                ':' if self.peek(1) == Some(':') => {
                    if self.follows_expression() || !self.try_function()? {
                        self.text.push_str("::");
                        self.pos += 2;
                    }
                }
                ':' => {
                    self.pos += 1;
                    match self.read_bind_name()? {
                        Some(name) => self.push_token(Token::Named(name)),
                        None => self.text.push(':'),
                    }
                }
                'i' | 'I' if self.at_keyword_into() => {
                    if self.try_into_clause()? {
                        // Drop the whitespace left in front of the removed clause.
                        let trimmed = self.text.trim_end().len();
                        self.text.truncate(trimmed);
                    } else {
                        let word: String = self.chars[self.pos..self.pos + 4].iter().collect();
                        self.text.push_str(&word);
                        self.pos += 4;
                    }
                }
                _ => {
                    self.text.push(c);
                    self.pos += 1;
                }
            }
        }
        self.flush_text();
        Ok(self.out)
    }
}

fn parse_arg(arg: &str) -> FunctionArg {
    if let Some(name) = arg.strip_prefix(':').filter(|n| !n.starts_with(':')) {
        let name = name
            .strip_prefix('{')
            .and_then(|n| n.strip_suffix('}'))
            .unwrap_or(name);
        FunctionArg::Bind(name.trim().to_string())
    } else if arg.len() >= 2 && arg.starts_with('\'') && arg.ends_with('\'') {
        FunctionArg::Literal(arg[1..arg.len() - 1].replace("''", "'"))
    } else {
        FunctionArg::Name(arg.to_string())
    }
}

/// Split `sql` into text and bind tokens.
pub fn parse(sql: &str) -> SqlResult<ParsedStatement> {
    Scanner::new(sql).run()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Token {
        Token::Text(s.to_string())
    }

    #[test]
    fn test_named_and_positional() {
        let parsed = parse("SELECT * FROM t WHERE a = :a AND b = :{person.id} AND c = ?").unwrap();
        assert_eq!(
            parsed.tokens,
            vec![
                text("SELECT * FROM t WHERE a = "),
                Token::Named("a".into()),
                text(" AND b = "),
                Token::Named("person.id".into()),
                text(" AND c = "),
                Token::Positional,
            ]
        );
        assert!(parsed.outputs.is_empty());
    }

    #[test]
    fn test_literals_and_comments_untouched() {
        let sql = "SELECT ':x', \"a?b\" FROM t -- :y ?\n/* :z */ WHERE d = '10:30'";
        let parsed = parse(sql).unwrap();
        assert_eq!(parsed.tokens, vec![text(sql)]);
    }

    #[test]
    fn test_casts_and_assignment_untouched() {
        let sql = "SELECT a::text, b := 1, (c)::numeric(10, 2)";
        assert_eq!(parse(sql).unwrap().tokens, vec![text(sql)]);
    }

    #[test]
    fn test_functions() {
        let parsed =
            parse("SELECT ::level(ReadPermission.LEVEL_ALL), ::text('hello', :name, World)").unwrap();
        let functions: Vec<_> = parsed.functions().collect();
        assert_eq!(
            functions[0],
            ("level", &[FunctionArg::Name("ReadPermission.LEVEL_ALL".into())][..])
        );
        assert_eq!(
            functions[1],
            (
                "text",
                &[
                    FunctionArg::Literal("hello".into()),
                    FunctionArg::Bind("name".into()),
                    FunctionArg::Name("World".into()),
                ][..]
            )
        );
    }

    #[test]
    fn test_function_without_args() {
        let parsed = parse("SELECT ::level()").unwrap();
        assert_eq!(parsed.functions().next(), Some(("level", &[][..])));
    }

    #[test]
    fn test_into_clause_removed() {
        let parsed = parse("SELECT a, b FROM t INTO :x, :{y.z} WHERE id = :id").unwrap();
        assert_eq!(parsed.outputs, vec!["x".to_string(), "y.z".to_string()]);
        assert_eq!(
            parsed.tokens,
            vec![text("SELECT a, b FROM t WHERE id = "), Token::Named("id".into())]
        );

        let parsed = parse("INSERT INTO t (a) VALUES (:a)").unwrap();
        assert!(parsed.outputs.is_empty());
        assert_eq!(parsed.tokens[0], text("INSERT INTO t (a) VALUES ("));
    }

    #[test]
    fn test_into_followed_by_other_binds() {
        let parsed = parse("SELECT a INTO :x, :y FROM t WHERE b = :b").unwrap();
        assert_eq!(parsed.outputs, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(parsed.input_names().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_malformed() {
        assert!(parse("SELECT ::code(Foo").is_err());
        assert!(parse("SELECT :{a").is_err());
        assert!(parse("SELECT ::text(a,,b)").is_err());
    }
}
