use crate::bytecode::op::{BinOp, CmpOp};
use crate::frontend::ast::{Expr, Stmt, StmtKind, Target};
use crate::frontend::lexer::{Lexer, Span, Spanned};
use crate::frontend::parser_error::FragmentError;
use crate::frontend::token::Token;
use crate::lang::value::Const;

/// Recursive-descent parser for fragment source.
///
/// Statements are separated by newlines or `;`. Expressions follow the usual
/// precedence, loosest first:
///
/// ```text
/// a if c else b
/// not x
/// a < b   (one comparison, no chaining)
/// a + b, a - b
/// a * b, a / b, a % b
/// -x
/// x.attr, f(..), x[..]
/// ```
pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    /// Span of the most recently consumed token, for errors at end of input.
    last_span: Option<Span>,
    /// Depth of the expression tree being built.
    depth: usize,
}

/// Deepest expression tree accepted. Parsing, compiling and dropping a tree
/// all recurse over it.
pub const MAX_NESTING: usize = 100;

/// Parse a statement suite.
pub fn parse_statements(source: &str) -> Result<Vec<Stmt>, FragmentError> {
    let tokens = Lexer::new(source).tokenize_clean()?;
    Parser::new(tokens).parse_suite()
}

/// Parse a single expression; anything after it is an error.
pub fn parse_expression(source: &str) -> Result<Expr, FragmentError> {
    let tokens = Lexer::new(source).tokenize_clean()?;
    Parser::new(tokens).parse_lone_expression()
}

impl Parser {
    pub fn new(tokens: Vec<Spanned>) -> Self {
        Parser {
            tokens,
            pos: 0,
            last_span: None,
            depth: 0,
        }
    }

    fn current(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn peek_next(&self) -> Option<&Token> {
        self.tokens.get(self.pos + 1).map(|s| &s.token)
    }

    fn advance(&mut self) -> Option<Token> {
        let spanned = self.tokens.get(self.pos)?;
        self.last_span = Some(spanned.span);
        let token = spanned.token.clone();
        self.pos += 1;
        Some(token)
    }

    fn at(&self, token: &Token) -> bool {
        self.peek() == Some(token)
    }

    /// Consume `token` if it is next.
    fn eat(&mut self, token: &Token) -> bool {
        if self.at(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, context: &str) -> Result<(), FragmentError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{}' {}", token, context)))
        }
    }

    fn line(&self) -> u32 {
        self.current()
            .map(|s| s.span.line)
            .or(self.last_span.map(|s| s.line))
            .unwrap_or(1) as u32
    }

    /// Error at the current token, falling back to the last consumed one.
    fn error(&self, message: &str) -> FragmentError {
        let span = self
            .current()
            .map(|s| s.span)
            .or(self.last_span)
            .unwrap_or(Span { line: 1, col: 1 });
        FragmentError::new(message, span.line, span.col)
    }

    fn unexpected(&self, message: &str) -> FragmentError {
        match self.peek() {
            Some(token) => self.error(&format!("{}, found {}", message, token)),
            None => self.error(message),
        }
    }

    /// Enter one more level of the expression tree.
    fn descend(&mut self) -> Result<(), FragmentError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(&format!(
                "expression nested too deeply (more than {} levels)",
                MAX_NESTING
            )));
        }
        self.depth += 1;
        Ok(())
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), Some(Token::Newline | Token::Semicolon)) {
            self.advance();
        }
    }

    fn at_end(&self) -> bool {
        matches!(self.peek(), None | Some(Token::Eof))
    }

    // =========================================================================
    // Statements
    // =========================================================================

    pub fn parse_suite(&mut self) -> Result<Vec<Stmt>, FragmentError> {
        let mut body = Vec::new();
        self.skip_separators();
        while !self.at_end() {
            body.push(self.parse_statement()?);
            if !self.at_end() && !matches!(self.peek(), Some(Token::Newline | Token::Semicolon)) {
                return Err(self.unexpected("expected end of statement"));
            }
            self.skip_separators();
        }
        Ok(body)
    }

    fn parse_statement(&mut self) -> Result<Stmt, FragmentError> {
        let line = self.line();
        let kind = match self.peek() {
            Some(Token::Pass) => {
                self.advance();
                StmtKind::Pass
            }
            Some(Token::Del) => {
                self.advance();
                match self.advance() {
                    Some(Token::Ident(name)) => StmtKind::Delete(name),
                    _ => return Err(self.error("'del' takes a single name")),
                }
            }
            Some(Token::Raise) => {
                self.advance();
                StmtKind::Raise(self.parse_expression_list()?)
            }
            _ => {
                let start = self.pos;
                let expr = self.parse_expression_list()?;
                if self.eat(&Token::Assign) {
                    let target = self.to_target(expr, start)?;
                    let value = self.parse_expression_list()?;
                    if self.at(&Token::Assign) {
                        return Err(self.error("chained assignment is not supported"));
                    }
                    StmtKind::Assign(target, value)
                } else {
                    StmtKind::Expr(expr)
                }
            }
        };
        Ok(Stmt::new(kind, line))
    }

    fn to_target(&self, expr: Expr, start: usize) -> Result<Target, FragmentError> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Attribute(obj, attr) => Ok(Target::Attribute(*obj, attr)),
            Expr::Subscript(obj, key) => Ok(Target::Subscript(*obj, *key)),
            _ => {
                let span = self.tokens[start].span;
                Err(FragmentError::new("cannot assign to expression", span.line, span.col))
            }
        }
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn parse_lone_expression(&mut self) -> Result<Expr, FragmentError> {
        self.skip_newlines();
        if self.at_end() {
            return Err(self.error("expected an expression"));
        }
        let expr = self.parse_expression_list()?;
        self.skip_newlines();
        if !self.at_end() {
            return Err(self.unexpected("expected end of expression"));
        }
        Ok(expr)
    }

    fn skip_newlines(&mut self) {
        while self.eat(&Token::Newline) {}
    }

    /// `a, b, c` builds a tuple; a single expression stays as is.
    fn parse_expression_list(&mut self) -> Result<Expr, FragmentError> {
        let first = self.parse_expr()?;
        if !self.at(&Token::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            if !self.starts_expression() {
                break;
            }
            items.push(self.parse_expr()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn starts_expression(&self) -> bool {
        matches!(
            self.peek(),
            Some(
                Token::Integer(_)
                    | Token::Float(_)
                    | Token::String(_)
                    | Token::None
                    | Token::True
                    | Token::False
                    | Token::Ident(_)
                    | Token::Not
                    | Token::Minus
                    | Token::LParen
                    | Token::LBracket
                    | Token::LBrace
            )
        )
    }

    pub fn parse_expr(&mut self) -> Result<Expr, FragmentError> {
        let base = self.depth;
        self.descend()?;
        let expr = self.parse_conditional();
        self.depth = base;
        expr
    }

    fn parse_conditional(&mut self) -> Result<Expr, FragmentError> {
        let then = self.parse_not()?;
        if !self.eat(&Token::If) {
            return Ok(then);
        }
        let cond = self.parse_not()?;
        self.expect(Token::Else, "in conditional expression")?;
        let otherwise = self.parse_expr()?;
        Ok(Expr::IfElse {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn parse_not(&mut self) -> Result<Expr, FragmentError> {
        if self.eat(&Token::Not) {
            let base = self.depth;
            self.descend()?;
            let operand = self.parse_not()?;
            self.depth = base;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, FragmentError> {
        let left = self.parse_arith()?;
        let Some(op) = self.peek().and_then(compare_op) else {
            return Ok(left);
        };
        self.advance();
        let right = self.parse_arith()?;
        if self.peek().and_then(compare_op).is_some() {
            return Err(self.error("chained comparisons are not supported"));
        }
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_arith(&mut self) -> Result<Expr, FragmentError> {
        let base = self.depth;
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Subtract,
                _ => {
                    self.depth = base;
                    return Ok(left);
                }
            };
            self.advance();
            // Each operator deepens the left-leaning tree.
            self.descend()?;
            let right = self.parse_term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_term(&mut self) -> Result<Expr, FragmentError> {
        let base = self.depth;
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Multiply,
                Some(Token::Slash) => BinOp::Divide,
                Some(Token::Percent) => BinOp::Modulo,
                _ => {
                    self.depth = base;
                    return Ok(left);
                }
            };
            self.advance();
            self.descend()?;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, FragmentError> {
        if !self.eat(&Token::Minus) {
            return self.parse_postfix();
        }
        let base = self.depth;
        self.descend()?;
        let operand = self.parse_unary()?;
        self.depth = base;
        // Negative numeric literals are folded.
        match operand {
            Expr::Literal(Const::Integer(n)) => Ok(Expr::Literal(Const::Integer(n.wrapping_neg()))),
            Expr::Literal(Const::Float(f)) => Ok(Expr::Literal(Const::Float(-f))),
            operand => Ok(Expr::Negate(Box::new(operand))),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, FragmentError> {
        let base = self.depth;
        let mut expr = self.parse_atom()?;
        loop {
            if matches!(self.peek(), Some(Token::Dot | Token::LParen | Token::LBracket)) {
                self.descend()?;
            }
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(attr)) => expr = Expr::Attribute(Box::new(expr), attr),
                        _ => return Err(self.error("expected attribute name after '.'")),
                    }
                }
                Some(Token::LParen) => {
                    self.advance();
                    let (args, kwargs) = self.parse_call_args()?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                        kwargs,
                    };
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let key = self.parse_expression_list()?;
                    self.expect(Token::RBracket, "to close subscript")?;
                    expr = Expr::Subscript(Box::new(expr), Box::new(key));
                }
                _ => {
                    self.depth = base;
                    return Ok(expr);
                }
            }
        }
    }

    /// Arguments after `(` up to and including `)`.
    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), FragmentError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();

        while !self.at(&Token::RParen) {
            let is_keyword =
                matches!(self.peek(), Some(Token::Ident(_))) && self.peek_next() == Some(&Token::Assign);
            if is_keyword {
                let Some(Token::Ident(name)) = self.advance() else {
                    return Err(self.error("expected keyword name"));
                };
                if kwargs.iter().any(|(k, _)| *k == name) {
                    return Err(self.error(&format!("keyword argument repeated: {}", name)));
                }
                self.advance(); // '='
                kwargs.push((name, self.parse_expr()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.parse_expr()?);
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RParen, "to close call")?;

        if args.len() > 0xFF || kwargs.len() > 0xFF {
            return Err(self.error("more than 255 arguments"));
        }
        Ok((args, kwargs))
    }

    fn parse_atom(&mut self) -> Result<Expr, FragmentError> {
        let Some(token) = self.peek().cloned() else {
            return Err(self.error("expected an expression"));
        };
        let expr = match token {
            Token::Integer(n) => Expr::Literal(Const::Integer(n)),
            Token::Float(f) => Expr::Literal(Const::Float(f)),
            Token::String(s) => {
                self.advance();
                // Adjacent string literals concatenate.
                let mut s = s;
                while let Some(Token::String(more)) = self.peek() {
                    s.push_str(more);
                    self.advance();
                }
                return Ok(Expr::Literal(Const::String(s)));
            }
            Token::None => Expr::Literal(Const::None),
            Token::True => Expr::Literal(Const::Bool(true)),
            Token::False => Expr::Literal(Const::Bool(false)),
            Token::Ident(name) => Expr::Name(name),
            Token::LParen => {
                self.advance();
                if self.eat(&Token::RParen) {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let inner = self.parse_expression_list()?;
                // `(a,)` is a one-element tuple; parse_expression_list made it.
                self.expect(Token::RParen, "to close parenthesis")?;
                return Ok(inner);
            }
            Token::LBracket => {
                self.advance();
                let items = self.parse_items(&Token::RBracket)?;
                return Ok(Expr::List(items));
            }
            Token::LBrace => {
                self.advance();
                return self.parse_dict();
            }
            _ => return Err(self.unexpected("expected an expression")),
        };
        self.advance();
        Ok(expr)
    }

    fn parse_items(&mut self, close: &Token) -> Result<Vec<Expr>, FragmentError> {
        let mut items = Vec::new();
        while !self.at(close) {
            items.push(self.parse_expr()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(close.clone(), "to close display")?;
        Ok(items)
    }

    fn parse_dict(&mut self) -> Result<Expr, FragmentError> {
        let mut pairs = Vec::new();
        while !self.at(&Token::RBrace) {
            let key = self.parse_expr()?;
            self.expect(Token::Colon, "after dict key")?;
            let value = self.parse_expr()?;
            pairs.push((key, value));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RBrace, "to close dict")?;
        Ok(Expr::Dict(pairs))
    }
}

fn compare_op(token: &Token) -> Option<CmpOp> {
    Some(match token {
        Token::Lt => CmpOp::Lt,
        Token::LtEq => CmpOp::Le,
        Token::EqEq => CmpOp::Eq,
        Token::NotEq => CmpOp::Ne,
        Token::Gt => CmpOp::Gt,
        Token::GtEq => CmpOp::Ge,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(n: &str) -> Expr {
        Expr::Name(n.to_string())
    }

    fn int(n: i64) -> Expr {
        Expr::Literal(Const::Integer(n))
    }

    fn kinds(source: &str) -> Vec<StmtKind> {
        parse_statements(source)
            .unwrap()
            .into_iter()
            .map(|s| s.kind)
            .collect()
    }

    #[test]
    fn test_precedence() {
        let expr = parse_expression("a + b * 2").unwrap();
        assert_eq!(
            expr,
            Expr::Binary(
                BinOp::Add,
                Box::new(name("a")),
                Box::new(Expr::Binary(BinOp::Multiply, Box::new(name("b")), Box::new(int(2))))
            )
        );
    }

    #[test]
    fn test_left_associative_subtraction() {
        let expr = parse_expression("1 - 2 - 3").unwrap();
        let Expr::Binary(BinOp::Subtract, left, right) = expr else {
            panic!("expected subtraction");
        };
        assert_eq!(*right, int(3));
        assert!(matches!(*left, Expr::Binary(BinOp::Subtract, _, _)));
    }

    #[test]
    fn test_conditional_binds_loosest() {
        let expr = parse_expression("x + 1 if not c else y").unwrap();
        let Expr::IfElse { cond, then, otherwise } = expr else {
            panic!("expected conditional");
        };
        assert_eq!(*cond, Expr::Not(Box::new(name("c"))));
        assert!(matches!(*then, Expr::Binary(BinOp::Add, _, _)));
        assert_eq!(*otherwise, name("y"));
    }

    #[test]
    fn test_postfix_chain() {
        let expr = parse_expression("obj.items[0].get(1, key='k')").unwrap();
        let Expr::Call { func, args, kwargs } = expr else {
            panic!("expected call");
        };
        assert_eq!(args, vec![int(1)]);
        assert_eq!(kwargs[0].0, "key");
        assert!(matches!(*func, Expr::Attribute(_, ref attr) if attr == "get"));
    }

    #[test]
    fn test_displays() {
        assert_eq!(parse_expression("()").unwrap(), Expr::Tuple(vec![]));
        assert_eq!(parse_expression("(1,)").unwrap(), Expr::Tuple(vec![int(1)]));
        assert_eq!(parse_expression("(1)").unwrap(), int(1));
        assert_eq!(parse_expression("[1, 2,]").unwrap(), Expr::List(vec![int(1), int(2)]));
        assert_eq!(
            parse_expression("{'a': 1}").unwrap(),
            Expr::Dict(vec![(Expr::Literal(Const::String("a".into())), int(1))])
        );
        assert_eq!(parse_expression("1, 2").unwrap(), Expr::Tuple(vec![int(1), int(2)]));
    }

    #[test]
    fn test_negative_literal_is_folded() {
        assert_eq!(parse_expression("-5").unwrap(), int(-5));
        assert_eq!(parse_expression("-x").unwrap(), Expr::Negate(Box::new(name("x"))));
    }

    #[test]
    fn test_statements_and_lines() {
        let body = parse_statements("a = 1; b = a\n\n# note\nobj.x = b\ndel a\npass").unwrap();
        let lines: Vec<u32> = body.iter().map(|s| s.line).collect();
        assert_eq!(lines, vec![1, 1, 4, 5, 6]);
        assert_eq!(body[2].kind, StmtKind::Assign(Target::Attribute(name("obj"), "x".into()), name("b")));
        assert_eq!(body[3].kind, StmtKind::Delete("a".into()));
        assert_eq!(body[4].kind, StmtKind::Pass);
    }

    #[test]
    fn test_subscript_assignment_and_raise() {
        assert_eq!(
            kinds("d['k'] = 2\nraise ValueError('bad')"),
            vec![
                StmtKind::Assign(
                    Target::Subscript(name("d"), Expr::Literal(Const::String("k".into()))),
                    int(2)
                ),
                StmtKind::Raise(Expr::Call {
                    func: Box::new(name("ValueError")),
                    args: vec![Expr::Literal(Const::String("bad".into()))],
                    kwargs: vec![],
                }),
            ]
        );
    }

    #[test]
    fn test_empty_suite() {
        assert!(parse_statements("").unwrap().is_empty());
        assert!(parse_statements("\n# only a comment\n").unwrap().is_empty());
    }

    #[test]
    fn test_assignment_in_expression_mode_fails() {
        let err = parse_expression("a = 1").unwrap_err();
        assert_eq!((err.line, err.col), (1, 3));
        assert!(err.message.contains("expected end of expression"));
    }

    #[test]
    fn test_bad_assignment_target() {
        let err = parse_statements("f() = 1").unwrap_err();
        assert!(err.message.contains("cannot assign"));
    }

    #[test]
    fn test_chained_comparison_rejected() {
        let err = parse_expression("a < b < c").unwrap_err();
        assert!(err.message.contains("chained"));
    }

    #[test]
    fn test_missing_statement_separator() {
        let err = parse_statements("a b").unwrap_err();
        assert_eq!((err.line, err.col), (1, 3));
    }

    #[test]
    fn test_error_at_end_uses_last_span() {
        let err = parse_expression("f(1,").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.col >= 4);
    }

    fn nested_parens(depth: usize) -> String {
        format!("{}1{}", "(".repeat(depth), ")".repeat(depth))
    }

    #[test]
    fn test_moderate_nesting_parses() {
        assert_eq!(parse_expression(&nested_parens(MAX_NESTING - 1)).unwrap(), int(1));
        assert!(parse_expression(&format!("{}1", "-".repeat(50))).is_ok());
    }

    #[test]
    fn test_deep_nesting_is_an_error() {
        let err = parse_expression(&nested_parens(300)).unwrap_err();
        assert!(err.message.contains("nested too deeply"));
        assert_eq!(err.line, 1);

        let err = parse_statements(&format!("x = {}", nested_parens(5000))).unwrap_err();
        assert!(err.message.contains("nested too deeply"));
    }

    #[test]
    fn test_long_operator_chain_is_an_error() {
        let sum = vec!["a"; 500].join(" + ");
        let err = parse_expression(&sum).unwrap_err();
        assert!(err.message.contains("nested too deeply"));

        let attrs = format!("a{}", ".b".repeat(500));
        assert!(parse_expression(&attrs).is_err());

        assert!(parse_expression(&vec!["a"; 20].join(" * ")).is_ok());
    }

    #[test]
    fn test_positional_after_keyword_rejected() {
        let err = parse_expression("f(a=1, 2)").unwrap_err();
        assert!(err.message.contains("positional argument follows"));
    }
}
