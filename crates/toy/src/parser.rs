//! Recursive-descent parser with Pratt-style expression precedence.
//!
//! Statement grammar and the precedence ladder follow the language
//! reference: ternary lowest, then `||`, `&&`, comparisons (including
//! `in`), `|`, `^`, `&`, shifts, additive, multiplicative, unary, and
//! postfix (call / index / slice / selector) tightest.
//!
//! The parser recovers from errors by synchronizing on `;`, `}`, and
//! statement keywords, emitting `Bad` nodes so later stages can still
//! report their own diagnostics.

use crate::{
    ast::{
        BinaryOp, ElseArm, Expr, ExprNode, FuncBody, FuncLit, InterpPart, LogicalOp, Param, SpreadElement, Stmt,
        StmtNode, TableEntry, TableKey, UnaryOp,
    },
    error::Diagnostic,
    source::Pos,
    token::{Token, TokenKind},
};

/// Parses a token stream into a statement list, collecting diagnostics.
pub(crate) fn parse(tokens: Vec<Token>) -> (Vec<StmtNode>, Vec<Diagnostic>) {
    let mut parser = Parser::new(tokens);
    let stmts = parser.parse_program();
    (stmts, parser.errors)
}

struct Parser {
    tokens: Vec<Token>,
    idx: usize,
    errors: Vec<Diagnostic>,
    /// Inside an `if`/`for` header a `{` opens the body, not a table
    /// literal. Parenthesized and bracketed subexpressions lift the
    /// restriction.
    no_table_literal: bool,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            idx: 0,
            errors: Vec::new(),
            no_table_literal: false,
        }
    }

    fn cur(&self) -> &Token {
        &self.tokens[self.idx.min(self.tokens.len() - 1)]
    }

    fn kind(&self) -> TokenKind {
        self.cur().kind
    }

    fn peek_kind(&self) -> TokenKind {
        self.tokens
            .get(self.idx + 1)
            .map_or(TokenKind::Eof, |t| t.kind)
    }

    fn pos(&self) -> Pos {
        self.cur().pos
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.kind() == kind
    }

    fn advance(&mut self) -> Token {
        let token = self.cur().clone();
        if self.idx < self.tokens.len() - 1 {
            self.idx += 1;
        }
        token
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> bool {
        if self.eat(kind) {
            true
        } else {
            self.error_here(format!("expected '{kind}', found '{}'", self.kind()));
            false
        }
    }

    fn error_here(&mut self, message: impl Into<String>) {
        let pos = self.pos();
        self.errors.push(Diagnostic::new(message, pos));
    }

    /// Skips ahead to a likely statement boundary after a parse error.
    fn synchronize(&mut self) {
        loop {
            match self.kind() {
                TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                TokenKind::Eof | TokenKind::RBrace => return,
                TokenKind::If
                | TokenKind::For
                | TokenKind::Return
                | TokenKind::Break
                | TokenKind::Continue
                | TokenKind::Defer
                | TokenKind::Export => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn parse_program(&mut self) -> Vec<StmtNode> {
        let mut stmts = Vec::new();
        while !self.at(TokenKind::Eof) {
            stmts.push(self.parse_stmt());
        }
        stmts
    }

    /// Consumes the statement terminator: an explicit or inserted `;`, or
    /// an upcoming `}` / EOF which themselves end the logical line.
    fn end_of_stmt(&mut self) {
        if self.eat(TokenKind::Semicolon) {
            return;
        }
        if self.at(TokenKind::RBrace) || self.at(TokenKind::Eof) {
            return;
        }
        self.error_here(format!("expected ';', found '{}'", self.kind()));
        self.synchronize();
    }

    fn parse_stmt(&mut self) -> StmtNode {
        let pos = self.pos();
        match self.kind() {
            TokenKind::Semicolon => {
                self.advance();
                StmtNode::new(Stmt::Empty, pos)
            }
            TokenKind::LBrace => {
                let body = self.parse_block();
                StmtNode::new(Stmt::Block(body), pos)
            }
            TokenKind::If => self.parse_if(),
            TokenKind::For => self.parse_for(),
            TokenKind::Return => self.parse_return(),
            TokenKind::Break => {
                self.advance();
                let label = self.parse_opt_label();
                self.end_of_stmt();
                StmtNode::new(Stmt::Break { label }, pos)
            }
            TokenKind::Continue => {
                self.advance();
                let label = self.parse_opt_label();
                self.end_of_stmt();
                StmtNode::new(Stmt::Continue { label }, pos)
            }
            TokenKind::Defer => {
                self.advance();
                let call = self.parse_expr();
                if !call.is_call() {
                    self.errors
                        .push(Diagnostic::new("defer expects a function call", call.pos));
                }
                self.end_of_stmt();
                StmtNode::new(Stmt::Defer { call }, pos)
            }
            TokenKind::Export => {
                self.advance();
                let value = self.parse_expr();
                self.end_of_stmt();
                StmtNode::new(Stmt::Export { value }, pos)
            }
            TokenKind::Ident if self.peek_kind() == TokenKind::Colon => {
                let label = self.advance().literal;
                self.advance(); // colon
                let stmt = self.parse_stmt();
                StmtNode::new(
                    Stmt::Labeled {
                        label,
                        stmt: Box::new(stmt),
                    },
                    pos,
                )
            }
            _ => {
                let stmt = self.parse_simple_stmt();
                self.end_of_stmt();
                stmt
            }
        }
    }

    fn parse_opt_label(&mut self) -> Option<String> {
        if self.at(TokenKind::Ident) {
            Some(self.advance().literal)
        } else {
            None
        }
    }

    fn parse_return(&mut self) -> StmtNode {
        let pos = self.pos();
        self.advance();
        let mut values = Vec::new();
        if !matches!(self.kind(), TokenKind::Semicolon | TokenKind::RBrace | TokenKind::Eof) {
            values.push(self.parse_expr());
            while self.eat(TokenKind::Comma) {
                values.push(self.parse_expr());
            }
        }
        self.end_of_stmt();
        StmtNode::new(Stmt::Return { values }, pos)
    }

    /// Parses an expression statement, declaration, or assignment — the
    /// statement forms legal in `if`/`for` headers.
    fn parse_simple_stmt(&mut self) -> StmtNode {
        let pos = self.pos();
        let mut exprs = vec![self.parse_expr()];
        while self.eat(TokenKind::Comma) {
            exprs.push(self.parse_expr());
        }

        match self.kind() {
            TokenKind::Declare => {
                self.advance();
                let names = self.targets_to_names(&exprs);
                let values = self.parse_expr_list();
                StmtNode::new(Stmt::Declare { names, values }, pos)
            }
            TokenKind::Assign => {
                self.advance();
                self.check_assign_targets(&exprs);
                let values = self.parse_expr_list();
                StmtNode::new(
                    Stmt::Assign {
                        targets: exprs,
                        op: None,
                        values,
                    },
                    pos,
                )
            }
            kind if kind.compound_base().is_some() => {
                let op = token_binary_op(kind.compound_base().expect("checked above"));
                self.advance();
                if exprs.len() != 1 {
                    self.error_here("compound assignment takes a single target");
                }
                self.check_assign_targets(&exprs);
                let values = self.parse_expr_list();
                if values.len() != 1 {
                    self.errors.push(Diagnostic::new(
                        "compound assignment takes a single value",
                        values.first().map_or(pos, |v| v.pos),
                    ));
                }
                StmtNode::new(
                    Stmt::Assign {
                        targets: exprs,
                        op: Some(op),
                        values,
                    },
                    pos,
                )
            }
            _ => {
                if exprs.len() != 1 {
                    self.error_here("expected ':=' or '=' after expression list");
                    return StmtNode::bad(pos);
                }
                let expr = exprs.pop().expect("one expression");
                StmtNode::new(Stmt::Expr(expr), pos)
            }
        }
    }

    fn parse_expr_list(&mut self) -> Vec<ExprNode> {
        let mut values = vec![self.parse_expr()];
        while self.eat(TokenKind::Comma) {
            values.push(self.parse_expr());
        }
        values
    }

    fn targets_to_names(&mut self, exprs: &[ExprNode]) -> Vec<(String, Pos)> {
        let mut names = Vec::with_capacity(exprs.len());
        for expr in exprs {
            if let Expr::Ident(name) = &expr.expr {
                names.push((name.clone(), expr.pos));
            } else {
                self.errors
                    .push(Diagnostic::new("':=' target must be an identifier", expr.pos));
            }
        }
        names
    }

    fn check_assign_targets(&mut self, exprs: &[ExprNode]) {
        for expr in exprs {
            if !matches!(
                expr.expr,
                Expr::Ident(_) | Expr::Index { .. } | Expr::Selector { .. } | Expr::Bad
            ) {
                self.errors
                    .push(Diagnostic::new("cannot assign to this expression", expr.pos));
            }
        }
    }

    fn parse_if(&mut self) -> StmtNode {
        let pos = self.pos();
        self.advance();

        let saved = std::mem::replace(&mut self.no_table_literal, true);
        let first = self.parse_simple_stmt();
        let (init, cond) = if self.eat(TokenKind::Semicolon) {
            let cond = self.parse_expr();
            (Some(Box::new(first)), cond)
        } else {
            match first.stmt {
                Stmt::Expr(expr) => (None, expr),
                _ => {
                    self.errors
                        .push(Diagnostic::new("expected ';' after if initializer", first.pos));
                    (Some(Box::new(StmtNode::bad(pos))), ExprNode::bad(pos))
                }
            }
        };
        self.no_table_literal = saved;

        let then = self.parse_block();
        let otherwise = if self.eat(TokenKind::Else) {
            if self.at(TokenKind::If) {
                Some(ElseArm::If(Box::new(self.parse_if())))
            } else {
                Some(ElseArm::Block(self.parse_block()))
            }
        } else {
            None
        };
        StmtNode::new(
            Stmt::If {
                init,
                cond,
                then,
                otherwise,
            },
            pos,
        )
    }

    fn parse_for(&mut self) -> StmtNode {
        let pos = self.pos();
        self.advance();

        // `for { ... }` — infinite loop.
        if self.at(TokenKind::LBrace) {
            let body = self.parse_block();
            return StmtNode::new(
                Stmt::For {
                    init: None,
                    cond: None,
                    post: None,
                    body,
                },
                pos,
            );
        }

        // `for k in it` / `for k, v in it`.
        if self.at(TokenKind::Ident)
            && (self.peek_kind() == TokenKind::In
                || (self.peek_kind() == TokenKind::Comma && self.peek2_is_ident_in()))
        {
            return self.parse_for_in(pos);
        }

        let saved = std::mem::replace(&mut self.no_table_literal, true);
        let first = self.parse_simple_stmt();
        let stmt = if self.eat(TokenKind::Semicolon) {
            // Three-clause form.
            let cond = if self.at(TokenKind::Semicolon) {
                None
            } else {
                Some(self.parse_expr())
            };
            self.expect(TokenKind::Semicolon);
            let post = if self.at(TokenKind::LBrace) {
                None
            } else {
                Some(Box::new(self.parse_simple_stmt()))
            };
            self.no_table_literal = saved;
            let body = self.parse_block();
            Stmt::For {
                init: Some(Box::new(first)),
                cond,
                post,
                body,
            }
        } else {
            // While form: the single clause must be an expression.
            self.no_table_literal = saved;
            let cond = match first.stmt {
                Stmt::Expr(expr) => Some(expr),
                _ => {
                    self.errors
                        .push(Diagnostic::new("expected expression as loop condition", first.pos));
                    None
                }
            };
            let body = self.parse_block();
            Stmt::For {
                init: None,
                cond,
                post: None,
                body,
            }
        };
        StmtNode::new(stmt, pos)
    }

    fn peek2_is_ident_in(&self) -> bool {
        self.tokens.get(self.idx + 2).is_some_and(|t| t.kind == TokenKind::Ident)
            && self.tokens.get(self.idx + 3).is_some_and(|t| t.kind == TokenKind::In)
    }

    fn parse_for_in(&mut self, pos: Pos) -> StmtNode {
        let key_tok = self.advance();
        let key = (key_tok.literal, key_tok.pos);
        let value = if self.eat(TokenKind::Comma) {
            let value_tok = self.advance();
            Some((value_tok.literal, value_tok.pos))
        } else {
            None
        };
        self.expect(TokenKind::In);
        let saved = std::mem::replace(&mut self.no_table_literal, true);
        let iterable = self.parse_expr();
        self.no_table_literal = saved;
        let body = self.parse_block();
        StmtNode::new(
            Stmt::ForIn {
                key,
                value,
                iterable,
                body,
            },
            pos,
        )
    }

    fn parse_block(&mut self) -> Vec<StmtNode> {
        let saved = std::mem::replace(&mut self.no_table_literal, false);
        let mut body = Vec::new();
        if self.expect(TokenKind::LBrace) {
            while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
                body.push(self.parse_stmt());
            }
            self.expect(TokenKind::RBrace);
        }
        self.no_table_literal = saved;
        body
    }

    // === Expressions ===

    fn parse_expr(&mut self) -> ExprNode {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> ExprNode {
        let cond = self.parse_binary(1);
        if !self.eat(TokenKind::Question) {
            return cond;
        }
        let pos = cond.pos;
        let then = self.parse_expr();
        self.expect(TokenKind::Colon);
        // Right-associative: the else branch may itself be a ternary.
        let otherwise = self.parse_ternary();
        ExprNode::new(
            Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            },
            pos,
        )
    }

    fn parse_binary(&mut self, min_prec: u8) -> ExprNode {
        let mut left = self.parse_unary();
        loop {
            let Some(prec) = binary_precedence(self.kind()) else {
                return left;
            };
            if prec < min_prec {
                return left;
            }
            let op_kind = self.advance().kind;
            let right = self.parse_binary(prec + 1);
            let pos = left.pos;
            left = match op_kind {
                TokenKind::AndAnd => ExprNode::new(
                    Expr::Logical {
                        op: LogicalOp::And,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    pos,
                ),
                TokenKind::OrOr => ExprNode::new(
                    Expr::Logical {
                        op: LogicalOp::Or,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    pos,
                ),
                _ => ExprNode::new(
                    Expr::Binary {
                        op: token_binary_op(op_kind),
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    pos,
                ),
            };
        }
    }

    fn parse_unary(&mut self) -> ExprNode {
        let pos = self.pos();
        let op = match self.kind() {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Pos,
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Caret => UnaryOp::BitNot,
            _ => return self.parse_postfix(),
        };
        self.advance();
        let operand = self.parse_unary();
        ExprNode::new(
            Expr::Unary {
                op,
                operand: Box::new(operand),
            },
            pos,
        )
    }

    fn parse_postfix(&mut self) -> ExprNode {
        let mut expr = self.parse_primary();
        loop {
            match self.kind() {
                TokenKind::LParen => {
                    let args = self.parse_call_args();
                    let pos = expr.pos;
                    expr = ExprNode::new(
                        Expr::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        pos,
                    );
                }
                TokenKind::LBracket => {
                    expr = self.parse_index_or_slice(expr);
                }
                TokenKind::Dot => {
                    self.advance();
                    let field_pos = self.pos();
                    let field = if self.at(TokenKind::Ident) {
                        self.advance().literal
                    } else {
                        self.error_here("expected field name after '.'");
                        String::new()
                    };
                    let pos = expr.pos;
                    expr = ExprNode::new(
                        Expr::Selector {
                            obj: Box::new(expr),
                            field,
                            field_pos,
                        },
                        pos,
                    );
                }
                _ => return expr,
            }
        }
    }

    fn parse_call_args(&mut self) -> Vec<SpreadElement> {
        let saved = std::mem::replace(&mut self.no_table_literal, false);
        self.expect(TokenKind::LParen);
        let mut args = Vec::new();
        while !self.at(TokenKind::RParen) && !self.at(TokenKind::Eof) {
            let splat = self.eat(TokenKind::Ellipsis);
            let expr = self.parse_expr();
            args.push(SpreadElement { expr, splat });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen);
        self.no_table_literal = saved;
        args
    }

    fn parse_index_or_slice(&mut self, obj: ExprNode) -> ExprNode {
        let saved = std::mem::replace(&mut self.no_table_literal, false);
        self.expect(TokenKind::LBracket);
        let pos = obj.pos;

        let low = if self.at(TokenKind::Colon) {
            None
        } else {
            Some(self.parse_expr())
        };
        let expr = if self.eat(TokenKind::Colon) {
            let high = if self.at(TokenKind::RBracket) {
                None
            } else {
                Some(self.parse_expr())
            };
            Expr::Slice {
                obj: Box::new(obj),
                low: low.map(Box::new),
                high: high.map(Box::new),
            }
        } else {
            match low {
                Some(index) => Expr::Index {
                    obj: Box::new(obj),
                    index: Box::new(index),
                },
                None => {
                    self.error_here("expected index expression");
                    Expr::Bad
                }
            }
        };
        self.expect(TokenKind::RBracket);
        self.no_table_literal = saved;
        ExprNode::new(expr, pos)
    }

    fn parse_primary(&mut self) -> ExprNode {
        let pos = self.pos();
        match self.kind() {
            TokenKind::Int => {
                let literal = self.advance().literal;
                match parse_int_literal(&literal) {
                    Some(value) => ExprNode::new(Expr::Int(value), pos),
                    None => {
                        self.errors
                            .push(Diagnostic::new(format!("invalid integer literal '{literal}'"), pos));
                        ExprNode::bad(pos)
                    }
                }
            }
            TokenKind::Float => {
                let literal = self.advance().literal;
                match literal.replace('_', "").parse::<f64>() {
                    Ok(value) => ExprNode::new(Expr::Float(value), pos),
                    Err(_) => {
                        self.errors
                            .push(Diagnostic::new(format!("invalid float literal '{literal}'"), pos));
                        ExprNode::bad(pos)
                    }
                }
            }
            TokenKind::Char => {
                let literal = self.advance().literal;
                let ch = literal.chars().next().unwrap_or('\0');
                ExprNode::new(Expr::Char(ch), pos)
            }
            TokenKind::StringFragment => {
                let literal = self.advance().literal;
                ExprNode::new(Expr::Str(literal), pos)
            }
            TokenKind::LQuote => self.parse_interpolated(pos),
            TokenKind::True => {
                self.advance();
                ExprNode::new(Expr::Bool(true), pos)
            }
            TokenKind::False => {
                self.advance();
                ExprNode::new(Expr::Bool(false), pos)
            }
            TokenKind::Nil => {
                self.advance();
                ExprNode::new(Expr::Nil, pos)
            }
            TokenKind::Ident => {
                let name = self.advance().literal;
                ExprNode::new(Expr::Ident(name), pos)
            }
            TokenKind::LParen => {
                let saved = std::mem::replace(&mut self.no_table_literal, false);
                self.advance();
                let inner = self.parse_expr();
                self.expect(TokenKind::RParen);
                self.no_table_literal = saved;
                ExprNode::new(Expr::Paren(Box::new(inner)), pos)
            }
            TokenKind::LBracket => self.parse_array_literal(pos),
            TokenKind::LBrace if !self.no_table_literal => self.parse_table_literal(pos),
            TokenKind::Fn => self.parse_func_literal(pos),
            TokenKind::Import => self.parse_import(pos),
            TokenKind::Try => {
                self.advance();
                let operand = self.parse_postfix();
                if !operand.is_call() {
                    self.errors
                        .push(Diagnostic::new("try expects a function call", operand.pos));
                }
                ExprNode::new(Expr::Try(Box::new(operand)), pos)
            }
            other => {
                self.error_here(format!("unexpected token '{other}'"));
                self.advance();
                ExprNode::bad(pos)
            }
        }
    }

    fn parse_interpolated(&mut self, pos: Pos) -> ExprNode {
        self.advance(); // LQuote
        let mut parts = Vec::new();
        loop {
            match self.kind() {
                TokenKind::StringFragment => {
                    let text = self.advance().literal;
                    if !text.is_empty() {
                        parts.push(InterpPart::Fragment(text));
                    }
                }
                TokenKind::LBrace => {
                    let saved = std::mem::replace(&mut self.no_table_literal, false);
                    self.advance();
                    let expr = self.parse_expr();
                    self.expect(TokenKind::RBrace);
                    self.no_table_literal = saved;
                    parts.push(InterpPart::Expr(expr));
                }
                TokenKind::RQuote => {
                    self.advance();
                    break;
                }
                _ => {
                    self.error_here("unterminated string literal");
                    break;
                }
            }
        }
        // A string with no interpolations is an ordinary literal.
        if parts.iter().all(|p| matches!(p, InterpPart::Fragment(_))) {
            let mut text = String::new();
            for part in parts {
                if let InterpPart::Fragment(fragment) = part {
                    text.push_str(&fragment);
                }
            }
            return ExprNode::new(Expr::Str(text), pos);
        }
        ExprNode::new(Expr::Interp(parts), pos)
    }

    fn parse_array_literal(&mut self, pos: Pos) -> ExprNode {
        let saved = std::mem::replace(&mut self.no_table_literal, false);
        self.advance(); // [
        let mut elements = Vec::new();
        while !self.at(TokenKind::RBracket) && !self.at(TokenKind::Eof) {
            let splat = self.eat(TokenKind::Ellipsis);
            let expr = self.parse_expr();
            elements.push(SpreadElement { expr, splat });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBracket);
        self.no_table_literal = saved;
        ExprNode::new(Expr::Array(elements), pos)
    }

    fn parse_table_literal(&mut self, pos: Pos) -> ExprNode {
        self.advance(); // {
        let mut entries = Vec::new();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            let key = match self.kind() {
                TokenKind::Ident | TokenKind::StringFragment => {
                    let tok = self.advance();
                    TableKey::Name(tok.literal, tok.pos)
                }
                TokenKind::LBracket => {
                    self.advance();
                    let expr = self.parse_expr();
                    self.expect(TokenKind::RBracket);
                    TableKey::Computed(expr)
                }
                other => {
                    self.error_here(format!("expected table key, found '{other}'"));
                    self.synchronize();
                    break;
                }
            };
            self.expect(TokenKind::Colon);
            let value = self.parse_expr();
            entries.push(TableEntry { key, value });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace);
        ExprNode::new(Expr::Table(entries), pos)
    }

    fn parse_func_literal(&mut self, pos: Pos) -> ExprNode {
        self.advance(); // fn
        self.expect(TokenKind::LParen);
        let mut params: Vec<Param> = Vec::new();
        let mut variadic = None;
        let mut seen_optional = false;
        while !self.at(TokenKind::RParen) && !self.at(TokenKind::Eof) {
            if self.eat(TokenKind::Ellipsis) {
                let tok = self.advance();
                if tok.kind == TokenKind::Ident {
                    if variadic.is_some() {
                        self.errors
                            .push(Diagnostic::new("only one variadic parameter is allowed", tok.pos));
                    }
                    variadic = Some((tok.literal, tok.pos));
                } else {
                    self.errors
                        .push(Diagnostic::new("expected parameter name after '...'", tok.pos));
                }
            } else if self.at(TokenKind::Ident) {
                let tok = self.advance();
                let optional = self.eat(TokenKind::Question);
                if variadic.is_some() {
                    self.errors
                        .push(Diagnostic::new("parameters cannot follow '...rest'", tok.pos));
                }
                if optional {
                    seen_optional = true;
                } else if seen_optional {
                    self.errors.push(Diagnostic::new(
                        "required parameters must precede optional parameters",
                        tok.pos,
                    ));
                }
                params.push(Param {
                    name: tok.literal,
                    pos: tok.pos,
                    optional,
                });
            } else {
                self.error_here(format!("expected parameter name, found '{}'", self.kind()));
                break;
            }
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen);

        let body = if self.at(TokenKind::LBrace) {
            FuncBody::Block(self.parse_block())
        } else {
            let saved = std::mem::replace(&mut self.no_table_literal, false);
            let expr = self.parse_expr();
            self.no_table_literal = saved;
            FuncBody::Expr(Box::new(expr))
        };
        ExprNode::new(
            Expr::Func(FuncLit {
                params,
                variadic,
                body,
                pos,
            }),
            pos,
        )
    }

    fn parse_import(&mut self, pos: Pos) -> ExprNode {
        self.advance(); // import
        self.expect(TokenKind::LParen);
        let name = match self.kind() {
            TokenKind::StringFragment => self.advance().literal,
            TokenKind::LQuote => {
                // A double-quoted literal: must be a plain fragment.
                let expr = self.parse_interpolated(pos);
                match expr.expr {
                    Expr::Str(name) => name,
                    _ => {
                        self.errors
                            .push(Diagnostic::new("import path must be a string literal", pos));
                        String::new()
                    }
                }
            }
            _ => {
                self.error_here("import path must be a string literal");
                String::new()
            }
        };
        self.expect(TokenKind::RParen);
        ExprNode::new(Expr::Import(name), pos)
    }
}

/// Precedence of an infix operator token; `None` for non-operators.
fn binary_precedence(kind: TokenKind) -> Option<u8> {
    Some(match kind {
        TokenKind::OrOr => 1,
        TokenKind::AndAnd => 2,
        TokenKind::Eq
        | TokenKind::NotEq
        | TokenKind::Less
        | TokenKind::LessEq
        | TokenKind::Greater
        | TokenKind::GreaterEq
        | TokenKind::In => 3,
        TokenKind::Pipe => 4,
        TokenKind::Caret => 5,
        TokenKind::Amp => 6,
        TokenKind::Shl | TokenKind::Shr => 7,
        TokenKind::Plus | TokenKind::Minus => 8,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => 9,
        _ => return None,
    })
}

fn token_binary_op(kind: TokenKind) -> BinaryOp {
    match kind {
        TokenKind::Plus => BinaryOp::Add,
        TokenKind::Minus => BinaryOp::Sub,
        TokenKind::Star => BinaryOp::Mul,
        TokenKind::Slash => BinaryOp::Div,
        TokenKind::Percent => BinaryOp::Rem,
        TokenKind::Amp => BinaryOp::BitAnd,
        TokenKind::Pipe => BinaryOp::BitOr,
        TokenKind::Caret => BinaryOp::BitXor,
        TokenKind::Shl => BinaryOp::Shl,
        TokenKind::Shr => BinaryOp::Shr,
        TokenKind::Eq => BinaryOp::Eq,
        TokenKind::NotEq => BinaryOp::Ne,
        TokenKind::Less => BinaryOp::Lt,
        TokenKind::LessEq => BinaryOp::Le,
        TokenKind::Greater => BinaryOp::Gt,
        TokenKind::GreaterEq => BinaryOp::Ge,
        TokenKind::In => BinaryOp::In,
        other => unreachable!("not a binary operator token: {other:?}"),
    }
}

/// Parses an integer literal with optional radix prefix and `_` separators.
fn parse_int_literal(text: &str) -> Option<i64> {
    let cleaned = text.replace('_', "");
    let (digits, radix) = if let Some(rest) = cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        (rest, 16)
    } else if let Some(rest) = cleaned.strip_prefix("0o").or_else(|| cleaned.strip_prefix("0O")) {
        (rest, 8)
    } else if let Some(rest) = cleaned.strip_prefix("0b").or_else(|| cleaned.strip_prefix("0B")) {
        (rest, 2)
    } else {
        (cleaned.as_str(), 10)
    };
    i64::from_str_radix(digits, radix).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lexer::Lexer, source::FileSet};

    fn parse_src(src: &str) -> (Vec<StmtNode>, Vec<Diagnostic>) {
        let mut set = FileSet::new();
        let id = set.add_file("test.toy", src.to_owned());
        let (tokens, lex_errors) = Lexer::new(&set, id).tokenize();
        assert!(lex_errors.is_empty(), "lex errors: {lex_errors:?}");
        parse(tokens)
    }

    fn parse_ok(src: &str) -> Vec<StmtNode> {
        let (stmts, errors) = parse_src(src);
        assert!(errors.is_empty(), "parse errors: {errors:?}");
        stmts
    }

    fn single_expr(src: &str) -> Expr {
        let stmts = parse_ok(src);
        assert_eq!(stmts.len(), 1, "expected one statement");
        match &stmts[0].stmt {
            Stmt::Expr(e) => e.expr.clone(),
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn precedence_mul_over_add() {
        let expr = single_expr("1 + 2 * 3");
        let Expr::Binary { op: BinaryOp::Add, right, .. } = expr else {
            panic!("expected addition at the top");
        };
        assert!(matches!(right.expr, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn comparison_binds_looser_than_bitwise_or() {
        let expr = single_expr("a == b | c");
        let Expr::Binary { op: BinaryOp::Eq, right, .. } = expr else {
            panic!("expected comparison at the top");
        };
        assert!(matches!(right.expr, Expr::Binary { op: BinaryOp::BitOr, .. }));
    }

    #[test]
    fn ternary_is_right_associative() {
        let expr = single_expr("a ? b : c ? d : e");
        let Expr::Ternary { otherwise, .. } = expr else {
            panic!("expected ternary");
        };
        assert!(matches!(otherwise.expr, Expr::Ternary { .. }));
    }

    #[test]
    fn declaration_and_assignment() {
        let stmts = parse_ok("x := 1\nx = 2");
        assert!(matches!(&stmts[0].stmt, Stmt::Declare { names, .. } if names[0].0 == "x"));
        assert!(matches!(&stmts[1].stmt, Stmt::Assign { op: None, .. }));
    }

    #[test]
    fn multi_target_assignment() {
        let stmts = parse_ok("a, b = b, a");
        let Stmt::Assign { targets, values, .. } = &stmts[0].stmt else {
            panic!("expected assignment");
        };
        assert_eq!(targets.len(), 2);
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn compound_assignment() {
        let stmts = parse_ok("x += 2");
        assert!(matches!(&stmts[0].stmt, Stmt::Assign { op: Some(BinaryOp::Add), .. }));
    }

    #[test]
    fn if_with_init() {
        let stmts = parse_ok("if x := f(); x > 0 { g() }");
        let Stmt::If { init, .. } = &stmts[0].stmt else {
            panic!("expected if");
        };
        assert!(init.is_some());
    }

    #[test]
    fn if_condition_is_not_a_table_literal() {
        let stmts = parse_ok("if x { y() }");
        let Stmt::If { cond, then, .. } = &stmts[0].stmt else {
            panic!("expected if");
        };
        assert!(matches!(cond.expr, Expr::Ident(_)));
        assert_eq!(then.len(), 1);
    }

    #[test]
    fn for_in_key_value() {
        let stmts = parse_ok("for k, v in m { s = s + v }");
        let Stmt::ForIn { key, value, .. } = &stmts[0].stmt else {
            panic!("expected for-in");
        };
        assert_eq!(key.0, "k");
        assert_eq!(value.as_ref().unwrap().0, "v");
    }

    #[test]
    fn three_clause_for() {
        let stmts = parse_ok("for i := 0; i < 10; i += 1 { f(i) }");
        let Stmt::For { init, cond, post, .. } = &stmts[0].stmt else {
            panic!("expected for");
        };
        assert!(init.is_some());
        assert!(cond.is_some());
        assert!(post.is_some());
    }

    #[test]
    fn func_literal_params() {
        let expr = single_expr("fn(a, b?, ...rest) { return a }");
        let Expr::Func(func) = expr else {
            panic!("expected function literal");
        };
        assert_eq!(func.params.len(), 2);
        assert!(!func.params[0].optional);
        assert!(func.params[1].optional);
        assert_eq!(func.variadic.as_ref().unwrap().0, "rest");
    }

    #[test]
    fn func_expression_body() {
        let expr = single_expr("fn(x) x + 1");
        let Expr::Func(func) = expr else {
            panic!("expected function literal");
        };
        assert!(matches!(func.body, FuncBody::Expr(_)));
    }

    #[test]
    fn splat_in_call_and_array() {
        let expr = single_expr("f(...xs, 1)");
        let Expr::Call { args, .. } = expr else {
            panic!("expected call");
        };
        assert!(args[0].splat);
        assert!(!args[1].splat);

        let expr = single_expr("[1, ...xs]");
        let Expr::Array(elements) = expr else {
            panic!("expected array");
        };
        assert!(elements[1].splat);
    }

    #[test]
    fn slices() {
        assert!(matches!(
            single_expr("a[1:2]"),
            Expr::Slice { low: Some(_), high: Some(_), .. }
        ));
        assert!(matches!(single_expr("a[:2]"), Expr::Slice { low: None, high: Some(_), .. }));
        assert!(matches!(single_expr("a[1:]"), Expr::Slice { low: Some(_), high: None, .. }));
        assert!(matches!(single_expr("a[:]"), Expr::Slice { low: None, high: None, .. }));
    }

    #[test]
    fn interpolation_parses_to_parts() {
        let expr = single_expr(r#""n = {n}!""#);
        let Expr::Interp(parts) = expr else {
            panic!("expected interpolation");
        };
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[0], InterpPart::Fragment(f) if f == "n = "));
        assert!(matches!(&parts[1], InterpPart::Expr(_)));
        assert!(matches!(&parts[2], InterpPart::Fragment(f) if f == "!"));
    }

    #[test]
    fn try_requires_call() {
        let (_, errors) = parse_src("x := try 1");
        assert!(errors.iter().any(|e| e.message.contains("try expects")));
    }

    #[test]
    fn defer_requires_call() {
        let (_, errors) = parse_src("defer x");
        assert!(errors.iter().any(|e| e.message.contains("defer expects")));
    }

    #[test]
    fn import_literal() {
        let expr = single_expr(r#"import("fmt")"#);
        assert!(matches!(expr, Expr::Import(name) if name == "fmt"));
    }

    #[test]
    fn labeled_break() {
        let stmts = parse_ok("outer: for { break outer }");
        let Stmt::Labeled { label, stmt } = &stmts[0].stmt else {
            panic!("expected labeled statement");
        };
        assert_eq!(label, "outer");
        assert!(matches!(stmt.stmt, Stmt::For { .. }));
    }

    #[test]
    fn recovery_produces_bad_nodes_and_continues() {
        let (stmts, errors) = parse_src("x := ] 1\ny := 2");
        assert!(!errors.is_empty());
        // The second statement still parses.
        assert!(stmts.iter().any(|s| matches!(&s.stmt, Stmt::Declare { names, .. } if names[0].0 == "y")));
    }

    #[test]
    fn hex_and_binary_int_literals() {
        assert!(matches!(single_expr("0xff"), Expr::Int(255)));
        assert!(matches!(single_expr("0b101"), Expr::Int(5)));
        assert!(matches!(single_expr("0o17"), Expr::Int(15)));
    }
}
