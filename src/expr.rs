//! Restricted arithmetic evaluator for expected-value formulas.
//!
//! Grammar (after `{{var}}` substitution):
//!   expr   := term (('+' | '-') term)*
//!   term   := factor (('*' | '/') factor)*
//!   factor := ('+' | '-') factor | number | '(' expr ')'
//!
//! Anything outside digits, `.`, `+ - * / ( )` and whitespace is rejected before parsing.
//! Nesting (parentheses and unary signs) is capped at `MAX_DEPTH`.

pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
  #[error("formula contains disallowed character {0:?}")]
  Disallowed(char),
  #[error("malformed number {0:?}")]
  BadNumber(String),
  #[error("unexpected end of formula")]
  UnexpectedEnd,
  #[error("unexpected token at position {0}")]
  Unexpected(usize),
  #[error("division by zero")]
  DivisionByZero,
  #[error("empty formula")]
  Empty,
  #[error("formula nests too deeply")]
  TooDeep,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
  Num(f64),
  Plus,
  Minus,
  Star,
  Slash,
  LParen,
  RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
  let chars: Vec<char> = src.chars().collect();
  let mut out = Vec::new();
  let mut i = 0;
  while i < chars.len() {
    let ch = chars[i];
    match ch {
      c if c.is_whitespace() => {}
      '+' => out.push(Token::Plus),
      '-' => out.push(Token::Minus),
      '*' => out.push(Token::Star),
      '/' => out.push(Token::Slash),
      '(' => out.push(Token::LParen),
      ')' => out.push(Token::RParen),
      c if c.is_ascii_digit() || c == '.' => {
        let start = i;
        while i + 1 < chars.len() && (chars[i + 1].is_ascii_digit() || chars[i + 1] == '.') {
          i += 1;
        }
        let lit: String = chars[start..=i].iter().collect();
        let n = lit.parse::<f64>().map_err(|_| ExprError::BadNumber(lit.clone()))?;
        out.push(Token::Num(n));
      }
      other => return Err(ExprError::Disallowed(other)),
    }
    i += 1;
  }
  Ok(out)
}

struct Parser {
  tokens: Vec<Token>,
  pos: usize,
  depth: usize,
}

impl Parser {
  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos)
  }

  fn next(&mut self) -> Option<Token> {
    let t = self.tokens.get(self.pos).cloned();
    self.pos += 1;
    t
  }

  fn expr(&mut self) -> Result<f64, ExprError> {
    let mut acc = self.term()?;
    while let Some(op) = self.peek() {
      match op {
        Token::Plus => { self.pos += 1; acc += self.term()?; }
        Token::Minus => { self.pos += 1; acc -= self.term()?; }
        _ => break,
      }
    }
    Ok(acc)
  }

  fn term(&mut self) -> Result<f64, ExprError> {
    let mut acc = self.factor()?;
    while let Some(op) = self.peek() {
      match op {
        Token::Star => { self.pos += 1; acc *= self.factor()?; }
        Token::Slash => {
          self.pos += 1;
          let rhs = self.factor()?;
          if rhs == 0.0 {
            return Err(ExprError::DivisionByZero);
          }
          acc /= rhs;
        }
        _ => break,
      }
    }
    Ok(acc)
  }

  fn factor(&mut self) -> Result<f64, ExprError> {
    if self.depth >= MAX_DEPTH {
      return Err(ExprError::TooDeep);
    }
    self.depth += 1;
    let v = self.primary();
    self.depth -= 1;
    v
  }

  fn primary(&mut self) -> Result<f64, ExprError> {
    let at = self.pos;
    match self.next() {
      Some(Token::Num(n)) => Ok(n),
      Some(Token::Plus) => self.factor(),
      Some(Token::Minus) => Ok(-self.factor()?),
      Some(Token::LParen) => {
        let v = self.expr()?;
        match self.next() {
          Some(Token::RParen) => Ok(v),
          Some(_) => Err(ExprError::Unexpected(self.pos - 1)),
          None => Err(ExprError::UnexpectedEnd),
        }
      }
      Some(_) => Err(ExprError::Unexpected(at)),
      None => Err(ExprError::UnexpectedEnd),
    }
  }
}

/// Evaluate an arithmetic formula. No variables, no functions.
pub fn evaluate(src: &str) -> Result<f64, ExprError> {
  let tokens = tokenize(src)?;
  if tokens.is_empty() {
    return Err(ExprError::Empty);
  }
  let mut p = Parser { tokens, pos: 0, depth: 0 };
  let v = p.expr()?;
  if p.pos < p.tokens.len() {
    return Err(ExprError::Unexpected(p.pos));
  }
  Ok(v)
}
