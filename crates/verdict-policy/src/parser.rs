// parser.rs — Lexer and recursive-descent parser for policy text.
//
// Grammar (one statement):
//
//   statement  := annotation* effect "(" principal "," action "," resource ")"
//                 clause* ";"
//   annotation := "@" ident "(" string ")"
//   principal  := "*" | "principal" [ "==" string | ".tags" key "==" string ]
//   action     := "*" | "action" [ "==" string | "in" "[" string,* "]" ]
//   resource   := "*" | "resource" [ "==" string ]
//   clause     := ("when" | "unless") "{" expr "}"
//   expr       := and ("||" and)*
//   and        := unary ("&&" unary)*
//   unary      := "!" unary | primary
//   primary    := "(" expr ")" | "true" | "false"
//               | attribute ( cmp literal | "in" "[" literal,* "]"
//                           | "like" string | "has" key )
//               | "context" "has" "input"
//               | literal cmp attribute
//   attribute  := "context" "." "input" segment* | "principal" "." "tags" segment
//   segment    := "." ident | "[" string "]"

use std::collections::{BTreeMap, BTreeSet};

use crate::ast::{
    ActionConstraint, Attribute, CmpOp, Condition, ConditionKind, Effect, Expr, Literal,
    PolicyStatement, PrincipalConstraint, ResourceConstraint,
};
use crate::error::PolicyError;

/// Parse text holding exactly one policy statement.
pub fn parse_policy(text: &str) -> Result<PolicyStatement, PolicyError> {
    let mut statements = parse_policy_set(text)?;
    match statements.len() {
        0 => Err(PolicyError::Empty),
        1 => Ok(statements.remove(0)),
        count => Err(PolicyError::MultipleStatements { count }),
    }
}

/// Parse text holding zero or more policy statements.
pub fn parse_policy_set(text: &str) -> Result<Vec<PolicyStatement>, PolicyError> {
    let tokens = Lexer::new(text).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut statements = Vec::new();
    while !parser.at_end() {
        statements.push(parser.statement()?);
    }
    Ok(statements)
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(f64),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semi,
    Dot,
    At,
    Star,
    Bang,
    AndAnd,
    OrOr,
    Cmp(CmpOp),
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Ident(s) => format!("'{}'", s),
            Tok::Str(s) => format!("string \"{}\"", s),
            Tok::Num(n) => format!("number {}", n),
            Tok::LParen => "'('".to_string(),
            Tok::RParen => "')'".to_string(),
            Tok::LBrace => "'{'".to_string(),
            Tok::RBrace => "'}'".to_string(),
            Tok::LBracket => "'['".to_string(),
            Tok::RBracket => "']'".to_string(),
            Tok::Comma => "','".to_string(),
            Tok::Semi => "';'".to_string(),
            Tok::Dot => "'.'".to_string(),
            Tok::At => "'@'".to_string(),
            Tok::Star => "'*'".to_string(),
            Tok::Bang => "'!'".to_string(),
            Tok::AndAnd => "'&&'".to_string(),
            Tok::OrOr => "'||'".to_string(),
            Tok::Cmp(op) => format!("'{}'", op),
        }
    }
}

#[derive(Debug, Clone)]
struct Spanned {
    tok: Tok,
    line: usize,
    column: usize,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, line: usize, column: usize, message: impl Into<String>) -> PolicyError {
        PolicyError::Parse {
            line,
            column,
            message: message.into(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<Spanned>, PolicyError> {
        let mut out = Vec::new();
        while let Some(&c) = self.chars.peek() {
            let (line, column) = (self.line, self.column);
            if c.is_whitespace() {
                self.bump();
                continue;
            }
            // Line comments.
            if c == '/' {
                self.bump();
                if self.chars.peek() == Some(&'/') {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                    continue;
                }
                return Err(self.error(line, column, "unexpected '/'"));
            }
            let tok = match c {
                '(' => self.single(Tok::LParen),
                ')' => self.single(Tok::RParen),
                '{' => self.single(Tok::LBrace),
                '}' => self.single(Tok::RBrace),
                '[' => self.single(Tok::LBracket),
                ']' => self.single(Tok::RBracket),
                ',' => self.single(Tok::Comma),
                ';' => self.single(Tok::Semi),
                '.' => self.single(Tok::Dot),
                '@' => self.single(Tok::At),
                '*' => self.single(Tok::Star),
                '"' => self.string(line, column)?,
                '&' => self.pair('&', Tok::AndAnd, line, column)?,
                '|' => self.pair('|', Tok::OrOr, line, column)?,
                '=' => self.pair('=', Tok::Cmp(CmpOp::Eq), line, column)?,
                '!' => {
                    self.bump();
                    if self.chars.peek() == Some(&'=') {
                        self.bump();
                        Tok::Cmp(CmpOp::Ne)
                    } else {
                        Tok::Bang
                    }
                }
                '<' | '>' => {
                    self.bump();
                    let or_equal = self.chars.peek() == Some(&'=');
                    if or_equal {
                        self.bump();
                    }
                    Tok::Cmp(match (c, or_equal) {
                        ('<', false) => CmpOp::Lt,
                        ('<', true) => CmpOp::Le,
                        ('>', false) => CmpOp::Gt,
                        _ => CmpOp::Ge,
                    })
                }
                '-' | '0'..='9' => self.number(line, column)?,
                c if c.is_ascii_alphabetic() || c == '_' => self.ident(),
                other => {
                    return Err(self.error(line, column, format!("unexpected character '{}'", other)))
                }
            };
            out.push(Spanned { tok, line, column });
        }
        Ok(out)
    }

    fn single(&mut self, tok: Tok) -> Tok {
        self.bump();
        tok
    }

    fn pair(&mut self, second: char, tok: Tok, line: usize, column: usize) -> Result<Tok, PolicyError> {
        let first = self.bump().unwrap_or(second);
        if self.chars.peek() == Some(&second) {
            self.bump();
            Ok(tok)
        } else {
            Err(self.error(line, column, format!("expected '{}{}'", first, second)))
        }
    }

    fn string(&mut self, line: usize, column: usize) -> Result<Tok, PolicyError> {
        self.bump(); // opening quote
        let mut s = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error(line, column, "unterminated string literal")),
                Some('"') => return Ok(Tok::Str(s)),
                Some('\\') => match self.bump() {
                    Some('"') => s.push('"'),
                    Some('\\') => s.push('\\'),
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some('r') => s.push('\r'),
                    Some(other) => {
                        return Err(self.error(
                            self.line,
                            self.column,
                            format!("unknown escape '\\{}'", other),
                        ))
                    }
                    None => return Err(self.error(line, column, "unterminated string literal")),
                },
                Some(c) => s.push(c),
            }
        }
    }

    fn number(&mut self, line: usize, column: usize) -> Result<Tok, PolicyError> {
        let mut raw = String::new();
        if self.chars.peek() == Some(&'-') {
            raw.push('-');
            self.bump();
        }
        let mut seen_dot = false;
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() {
                raw.push(c);
                self.bump();
            } else if c == '.' && !seen_dot {
                seen_dot = true;
                raw.push(c);
                self.bump();
            } else {
                break;
            }
        }
        match raw.parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(Tok::Num(n)),
            _ => Err(self.error(line, column, format!("invalid number '{}'", raw))),
        }
    }

    fn ident(&mut self) -> Tok {
        let mut s = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                s.push(c);
                self.bump();
            } else {
                break;
            }
        }
        Tok::Ident(s)
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|s| &s.tok)
    }

    fn peek_ident(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Tok::Ident(s)) if s == word)
    }

    fn next(&mut self) -> Result<Tok, PolicyError> {
        match self.tokens.get(self.pos) {
            Some(spanned) => {
                self.pos += 1;
                Ok(spanned.tok.clone())
            }
            None => Err(self.error_here("unexpected end of input")),
        }
    }

    fn error_here(&self, message: impl Into<String>) -> PolicyError {
        let (line, column) = match self.tokens.get(self.pos).or_else(|| self.tokens.last()) {
            Some(s) => (s.line, s.column),
            None => (1, 1),
        };
        PolicyError::Parse {
            line,
            column,
            message: message.into(),
        }
    }

    fn unexpected(&self, expected: &str) -> PolicyError {
        match self.peek() {
            Some(tok) => self.error_here(format!("expected {}, found {}", expected, tok.describe())),
            None => self.error_here(format!("expected {}, found end of input", expected)),
        }
    }

    fn expect(&mut self, want: Tok, expected: &str) -> Result<(), PolicyError> {
        if self.peek() == Some(&want) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn expect_ident(&mut self, word: &str) -> Result<(), PolicyError> {
        if self.peek_ident(word) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", word)))
        }
    }

    fn string(&mut self, expected: &str) -> Result<String, PolicyError> {
        match self.peek() {
            Some(Tok::Str(_)) => match self.next()? {
                Tok::Str(s) => Ok(s),
                _ => Err(self.unexpected(expected)),
            },
            _ => Err(self.unexpected(expected)),
        }
    }

    fn statement(&mut self) -> Result<PolicyStatement, PolicyError> {
        let mut annotations = BTreeMap::new();
        while self.peek() == Some(&Tok::At) {
            self.pos += 1;
            let key = match self.next()? {
                Tok::Ident(key) => key,
                _ => return Err(self.error_here("expected annotation name after '@'")),
            };
            self.expect(Tok::LParen, "'('")?;
            let value = self.string("annotation value string")?;
            self.expect(Tok::RParen, "')'")?;
            if annotations.insert(key.clone(), value).is_some() {
                return Err(self.error_here(format!("duplicate annotation '@{}'", key)));
            }
        }

        let effect = match self.peek() {
            Some(Tok::Ident(word)) if word == "permit" => Effect::Permit,
            Some(Tok::Ident(word)) if word == "forbid" => Effect::Forbid,
            _ => return Err(self.unexpected("'permit' or 'forbid'")),
        };
        self.pos += 1;

        self.expect(Tok::LParen, "'('")?;
        let principal = self.principal_constraint()?;
        self.expect(Tok::Comma, "','")?;
        let action = self.action_constraint()?;
        self.expect(Tok::Comma, "','")?;
        let resource = self.resource_constraint()?;
        self.expect(Tok::RParen, "')'")?;

        let mut conditions = Vec::new();
        loop {
            let kind = if self.peek_ident("when") {
                ConditionKind::When
            } else if self.peek_ident("unless") {
                ConditionKind::Unless
            } else {
                break;
            };
            self.pos += 1;
            self.expect(Tok::LBrace, "'{'")?;
            let body = self.expr()?;
            self.expect(Tok::RBrace, "'}'")?;
            conditions.push(Condition { kind, body });
        }
        self.expect(Tok::Semi, "';'")?;

        Ok(PolicyStatement {
            annotations,
            effect,
            principal,
            action,
            resource,
            conditions,
        })
    }

    fn principal_constraint(&mut self) -> Result<PrincipalConstraint, PolicyError> {
        if self.peek() == Some(&Tok::Star) {
            self.pos += 1;
            return Ok(PrincipalConstraint::Any);
        }
        self.expect_ident("principal")?;
        match self.peek() {
            Some(Tok::Cmp(CmpOp::Eq)) => {
                self.pos += 1;
                let id = self.string("principal identity string")?;
                Ok(PrincipalConstraint::Exact { id })
            }
            Some(Tok::Dot) => {
                self.pos += 1;
                self.expect_ident("tags")?;
                let key = self.segment()?;
                self.expect(Tok::Cmp(CmpOp::Eq), "'=='")?;
                let value = self.string("tag value string")?;
                Ok(PrincipalConstraint::Tagged { key, value })
            }
            _ => Ok(PrincipalConstraint::Any),
        }
    }

    fn action_constraint(&mut self) -> Result<ActionConstraint, PolicyError> {
        if self.peek() == Some(&Tok::Star) {
            self.pos += 1;
            return Ok(ActionConstraint::Any);
        }
        self.expect_ident("action")?;
        if self.peek() == Some(&Tok::Cmp(CmpOp::Eq)) {
            self.pos += 1;
            let name = self.string("action name string")?;
            return Ok(ActionConstraint::Exact { name });
        }
        if self.peek_ident("in") {
            self.pos += 1;
            self.expect(Tok::LBracket, "'['")?;
            let mut names = BTreeSet::new();
            if self.peek() != Some(&Tok::RBracket) {
                loop {
                    names.insert(self.string("action name string")?);
                    if self.peek() == Some(&Tok::Comma) {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
            }
            self.expect(Tok::RBracket, "']'")?;
            return Ok(ActionConstraint::In { names });
        }
        Ok(ActionConstraint::Any)
    }

    fn resource_constraint(&mut self) -> Result<ResourceConstraint, PolicyError> {
        if self.peek() == Some(&Tok::Star) {
            self.pos += 1;
            return Ok(ResourceConstraint::Any);
        }
        self.expect_ident("resource")?;
        if self.peek() == Some(&Tok::Cmp(CmpOp::Eq)) {
            self.pos += 1;
            let id = self.string("resource identifier string")?;
            return Ok(ResourceConstraint::Exact { id });
        }
        Ok(ResourceConstraint::Any)
    }

    /// `.ident` or `["key"]`.
    fn segment(&mut self) -> Result<String, PolicyError> {
        match self.peek() {
            Some(Tok::Dot) => {
                self.pos += 1;
                match self.next()? {
                    Tok::Ident(s) => Ok(s),
                    _ => Err(self.error_here("expected field name after '.'")),
                }
            }
            Some(Tok::LBracket) => {
                self.pos += 1;
                let key = self.string("quoted field name")?;
                self.expect(Tok::RBracket, "']'")?;
                Ok(key)
            }
            _ => Err(self.unexpected("'.' or '['")),
        }
    }

    fn expr(&mut self) -> Result<Expr, PolicyError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Tok::OrOr) {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expr::or(left, right);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, PolicyError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Tok::AndAnd) {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::and(left, right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, PolicyError> {
        if self.peek() == Some(&Tok::Bang) {
            self.pos += 1;
            return Ok(Expr::not(self.unary()?));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, PolicyError> {
        match self.peek() {
            Some(Tok::LParen) => {
                self.pos += 1;
                let inner = self.expr()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Some(Tok::Ident(word)) if word == "true" || word == "false" => {
                let value = word == "true";
                self.pos += 1;
                // `true == context.input.flag` is a literal-first comparison.
                if let Some(Tok::Cmp(_)) = self.peek() {
                    return self.literal_first(Literal::Bool(value));
                }
                Ok(Expr::Bool { value })
            }
            Some(Tok::Ident(word)) if word == "context" || word == "principal" => {
                self.attribute_predicate()
            }
            Some(Tok::Str(_)) | Some(Tok::Num(_)) => {
                let literal = self.literal()?;
                self.literal_first(literal)
            }
            _ => Err(self.unexpected("a condition")),
        }
    }

    fn literal_first(&mut self, literal: Literal) -> Result<Expr, PolicyError> {
        let op = match self.next()? {
            Tok::Cmp(op) => op,
            _ => return Err(self.error_here("expected comparison operator")),
        };
        let (attr, has_key) = self.attribute()?;
        if has_key.is_some() {
            return Err(self.error_here("'has' cannot appear in a comparison"));
        }
        let attr = attr.ok_or_else(|| self.error_here("expected an attribute"))?;
        Ok(Expr::Compare {
            attr,
            op: op.flipped(),
            value: literal,
        })
    }

    fn attribute_predicate(&mut self) -> Result<Expr, PolicyError> {
        let (attr, has_key) = self.attribute()?;
        if let Some(attr) = has_key {
            return Ok(Expr::Has { attr });
        }
        let attr = attr.ok_or_else(|| self.error_here("'context.input' must be followed by a field"))?;
        match self.peek() {
            Some(Tok::Cmp(op)) => {
                let op = *op;
                self.pos += 1;
                if matches!(self.peek(), Some(Tok::Ident(w)) if w == "context" || w == "principal") {
                    return Err(self.error_here("comparisons must relate an attribute to a literal"));
                }
                let value = self.literal()?;
                Ok(Expr::Compare { attr, op, value })
            }
            Some(Tok::Ident(word)) if word == "in" => {
                self.pos += 1;
                self.expect(Tok::LBracket, "'['")?;
                let mut values = Vec::new();
                if self.peek() != Some(&Tok::RBracket) {
                    loop {
                        values.push(self.literal()?);
                        if self.peek() == Some(&Tok::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Tok::RBracket, "']'")?;
                Ok(Expr::In { attr, values })
            }
            Some(Tok::Ident(word)) if word == "like" => {
                self.pos += 1;
                let pattern = self.string("pattern string")?;
                Ok(Expr::Like { attr, pattern })
            }
            _ => Err(self.unexpected("comparison, 'in', 'like' or 'has'")),
        }
    }

    /// Parse an attribute reference.
    ///
    /// Returns `(attr, None)` for a plain reference, or `(_, Some(attr))`
    /// when the reference is followed by `has key`, in which case the
    /// returned attribute is the full path being tested for presence.
    fn attribute(&mut self) -> Result<(Option<Attribute>, Option<Attribute>), PolicyError> {
        let root = match self.next()? {
            Tok::Ident(word) => word,
            _ => return Err(self.error_here("expected an attribute")),
        };
        match root.as_str() {
            "context" => {
                // `context has input`: the request carries any input at all.
                if self.peek_ident("has") {
                    self.pos += 1;
                    self.expect_ident("input")?;
                    return Ok((None, Some(Attribute::Input(Vec::new()))));
                }
                self.expect(Tok::Dot, "'.'")?;
                self.expect_ident("input")?;
                let mut path = Vec::new();
                while matches!(self.peek(), Some(Tok::Dot) | Some(Tok::LBracket)) {
                    path.push(self.segment()?);
                }
                if self.peek_ident("has") {
                    self.pos += 1;
                    path.push(self.has_key()?);
                    return Ok((None, Some(Attribute::Input(path))));
                }
                if path.is_empty() {
                    return Ok((None, None));
                }
                Ok((Some(Attribute::Input(path)), None))
            }
            "principal" => {
                self.expect(Tok::Dot, "'.'")?;
                self.expect_ident("tags")?;
                if self.peek_ident("has") {
                    self.pos += 1;
                    let key = self.has_key()?;
                    return Ok((None, Some(Attribute::PrincipalTag(key))));
                }
                let key = self.segment()?;
                if matches!(self.peek(), Some(Tok::Dot) | Some(Tok::LBracket)) {
                    return Err(self.error_here("principal tags are flat; nested access is not allowed"));
                }
                if self.peek_ident("has") {
                    return Err(self.error_here("principal tags are flat; use 'principal.tags has key'"));
                }
                Ok((Some(Attribute::PrincipalTag(key)), None))
            }
            other => Err(self.error_here(format!(
                "unknown attribute root '{}'; expected 'context' or 'principal'",
                other
            ))),
        }
    }

    fn has_key(&mut self) -> Result<String, PolicyError> {
        match self.next()? {
            Tok::Ident(key) => Ok(key),
            Tok::Str(key) => Ok(key),
            _ => Err(self.error_here("expected field name after 'has'")),
        }
    }

    fn literal(&mut self) -> Result<Literal, PolicyError> {
        match self.peek() {
            Some(Tok::Str(_)) | Some(Tok::Num(_)) | Some(Tok::Ident(_)) => {}
            _ => return Err(self.unexpected("a literal")),
        }
        match self.next()? {
            Tok::Str(s) => Ok(Literal::String(s)),
            Tok::Num(n) => Ok(Literal::Number(n)),
            Tok::Ident(word) if word == "true" => Ok(Literal::Bool(true)),
            Tok::Ident(word) if word == "false" => Ok(Literal::Bool(false)),
            Tok::Ident(word) => {
                self.pos -= 1;
                Err(self.error_here(format!("expected a literal, found '{}'", word)))
            }
            _ => Err(self.error_here("expected a literal")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scenario_refund_permit() {
        let stmt = parse_policy(
            r#"permit(*, action == "process_refund", *) when { context.input.amount < 1000 };"#,
        )
        .unwrap();
        assert_eq!(stmt.effect, Effect::Permit);
        assert_eq!(stmt.principal, PrincipalConstraint::Any);
        assert_eq!(
            stmt.action,
            ActionConstraint::Exact {
                name: "process_refund".to_string()
            }
        );
        assert_eq!(stmt.resource, ResourceConstraint::Any);
        assert_eq!(stmt.conditions.len(), 1);
        assert_eq!(
            stmt.conditions[0].body,
            Expr::Compare {
                attr: Attribute::Input(vec!["amount".to_string()]),
                op: CmpOp::Lt,
                value: Literal::Number(1000.0),
            }
        );
    }

    #[test]
    fn parses_tag_predicate_and_action_set() {
        let stmt = parse_policy(
            r#"forbid(principal.tags.role == "intern", action in ["delete_user", "drop_table"], resource == "gw-prod");"#,
        )
        .unwrap();
        assert_eq!(
            stmt.principal,
            PrincipalConstraint::Tagged {
                key: "role".to_string(),
                value: "intern".to_string()
            }
        );
        match &stmt.action {
            ActionConstraint::In { names } => assert_eq!(names.len(), 2),
            other => panic!("expected In, got {:?}", other),
        }
        assert_eq!(
            stmt.resource,
            ResourceConstraint::Exact {
                id: "gw-prod".to_string()
            }
        );
    }

    #[test]
    fn literal_first_comparison_is_flipped() {
        let stmt = parse_policy(
            r#"permit(principal, action, resource) when { 1000 > context.input.amount };"#,
        )
        .unwrap();
        match &stmt.conditions[0].body {
            Expr::Compare { op, .. } => assert_eq!(*op, CmpOp::Lt),
            other => panic!("expected Compare, got {:?}", other),
        }
    }

    #[test]
    fn has_builds_full_path() {
        let stmt = parse_policy(
            r#"permit(principal, action, resource)
               when { context.input.customer has tier && principal.tags has role };"#,
        )
        .unwrap();
        let mut attrs = Vec::new();
        stmt.conditions[0].body.attributes(&mut attrs);
        assert_eq!(
            attrs[0],
            &Attribute::Input(vec!["customer".to_string(), "tier".to_string()])
        );
        assert_eq!(attrs[1], &Attribute::PrincipalTag("role".to_string()));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let stmt = parse_policy(
            r#"permit(principal, action, resource)
               when { context.input.a == 1 || context.input.b == 2 && context.input.c == 3 };"#,
        )
        .unwrap();
        match &stmt.conditions[0].body {
            Expr::Or { right, .. } => assert!(matches!(**right, Expr::And { .. })),
            other => panic!("expected Or at the root, got {:?}", other),
        }
    }

    #[test]
    fn annotations_and_comments() {
        let set = parse_policy_set(
            r#"
            // refund rules
            @id("small-refunds")
            @description("agents may refund small amounts")
            permit(principal, action == "process_refund", resource)
            when { context.input.amount < 1000 };

            forbid(principal, action == "process_refund", resource)
            unless { principal.tags.role == "manager" };
            "#,
        )
        .unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set[0].id_annotation(), Some("small-refunds"));
        assert_eq!(set[1].conditions[0].kind, ConditionKind::Unless);
    }

    #[test]
    fn rejects_attribute_to_attribute_comparison() {
        let err = parse_policy(
            r#"permit(principal, action, resource) when { context.input.a < context.input.b };"#,
        )
        .unwrap_err();
        match err {
            PolicyError::Parse { message, .. } => assert!(message.contains("literal")),
            other => panic!("expected Parse error, got {:?}", other),
        }
    }

    #[test]
    fn reports_position_of_missing_semicolon() {
        let err = parse_policy("permit(principal, action, resource)").unwrap_err();
        assert!(matches!(err, PolicyError::Parse { line: 1, .. }));
    }

    #[test]
    fn rejects_multiple_statements_for_single_parse() {
        let err = parse_policy(
            "permit(principal, action, resource); forbid(principal, action, resource);",
        )
        .unwrap_err();
        assert_eq!(err, PolicyError::MultipleStatements { count: 2 });
    }

    #[test]
    fn empty_text_is_an_error() {
        assert_eq!(parse_policy("  // nothing\n").unwrap_err(), PolicyError::Empty);
    }

    #[test]
    fn display_round_trips() {
        let text = r#"@id("refunds")
permit(principal.tags.role == "agent", action in ["process_refund", "void_refund"], resource == "gw-a")
when { context.input.amount < 1000 && !context.input.currency in ["XAU", "BTC"] }
unless { context.input["customer-id"] like "TEST-*" || principal.tags has suspended };"#;
        let parsed = parse_policy(text).unwrap();
        let printed = parsed.to_string();
        let reparsed = parse_policy(&printed).unwrap();
        assert_eq!(parsed, reparsed);
        assert_eq!(printed, text);
    }

    #[test]
    fn string_escapes_round_trip() {
        let text = r#"permit(principal == "a \"quoted\" \\ id", action, resource);"#;
        let parsed = parse_policy(text).unwrap();
        assert_eq!(
            parsed.principal,
            PrincipalConstraint::Exact {
                id: "a \"quoted\" \\ id".to_string()
            }
        );
        assert_eq!(parse_policy(&parsed.to_string()).unwrap(), parsed);
    }

    #[test]
    fn input_presence_round_trips() {
        let built = PolicyStatement::new(
            Effect::Forbid,
            PrincipalConstraint::Any,
            ActionConstraint::Any,
            ResourceConstraint::Any,
        )
        .unless(Expr::Has {
            attr: Attribute::Input(Vec::new()),
        });
        let printed = built.to_string();
        assert!(printed.contains("context has input"), "{}", printed);
        assert_eq!(parse_policy(&printed).unwrap(), built);
    }

    #[test]
    fn input_presence_needs_the_input_keyword() {
        assert!(parse_policy("permit(principal, action, resource) when { context has amount };").is_err());
    }
}
