/// Hand-rolled tokenizer for predicate expressions. Produces string slices
/// with their byte positions; the parser gives them meaning.
pub(crate) struct Lexer<'a> {
    input: &'a str,
    pos: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Token<'a> {
    /// A field path: `$.a.b`, `$attributes.k`, `$resource.k`, `$`.
    Path(&'a str),

    /// A quoted string literal, quotes stripped.
    String(&'a str),

    /// A numeric literal.
    Number(f64),

    /// A bare word: `and`, `or`, `contains`, `match`, `env`, `true`…
    Word(&'a str),

    /// `==`, `!=`, `<`, `<=`, `>`, `>=`, `(`, `)`.
    Symbol(&'a str),
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer { input, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.input.len() - trimmed.len();
    }

    pub fn next(&mut self) -> Option<Result<(usize, Token<'a>), String>> {
        self.skip_whitespace();
        let start = self.pos;
        let rest = self.rest();
        let mut chars = rest.chars();
        let first = chars.next()?;

        let token = match first {
            '(' | ')' => {
                self.pos += 1;
                Token::Symbol(&rest[..1])
            }
            '=' | '!' => {
                if rest.len() < 2 || rest.as_bytes()[1] != b'=' {
                    return Some(Err(format!("expected '==' or '!=' at {start}")));
                }
                self.pos += 2;
                Token::Symbol(&rest[..2])
            }
            '<' | '>' => {
                let len = if rest.as_bytes().get(1) == Some(&b'=') { 2 } else { 1 };
                self.pos += len;
                Token::Symbol(&rest[..len])
            }
            '\'' | '"' => {
                let quote = first;
                match rest[1..].find(quote) {
                    Some(end) => {
                        self.pos += end + 2;
                        Token::String(&rest[1..end + 1])
                    }
                    None => return Some(Err(format!("unterminated string at {start}"))),
                }
            }
            '$' => {
                let end = rest
                    .find(|c: char| {
                        !(c.is_ascii_alphanumeric() || matches!(c, '$' | '.' | '_' | '-'))
                    })
                    .unwrap_or(rest.len());
                self.pos += end;
                Token::Path(&rest[..end])
            }
            c if c.is_ascii_digit() || c == '-' => {
                let end = rest[1..]
                    .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                    .map(|offset| offset + 1)
                    .unwrap_or(rest.len());
                match rest[..end].parse::<f64>() {
                    Ok(value) => {
                        self.pos += end;
                        Token::Number(value)
                    }
                    Err(_) => return Some(Err(format!("invalid number at {start}"))),
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let end = rest
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(rest.len());
                self.pos += end;
                Token::Word(&rest[..end])
            }
            other => return Some(Err(format!("unexpected character '{other}' at {start}"))),
        };

        Some(Ok((start, token)))
    }

    /// Peeks without consuming.
    pub fn peek(&mut self) -> Option<Result<(usize, Token<'a>), String>> {
        let saved = self.pos;
        let token = self.next();
        self.pos = saved;
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<Token<'_>> {
        let mut lexer = Lexer::new(input);
        let mut out = Vec::new();
        while let Some(token) = lexer.next() {
            out.push(token.unwrap().1);
        }
        out
    }

    #[test]
    fn lex_comparison() {
        assert_eq!(
            tokens("$.status >= 400"),
            vec![
                Token::Path("$.status"),
                Token::Symbol(">="),
                Token::Number(400.0),
            ]
        );
    }

    #[test]
    fn lex_logical_and_parens() {
        assert_eq!(
            tokens("($attributes.env == 'prod') and $.code != \"ok\""),
            vec![
                Token::Symbol("("),
                Token::Path("$attributes.env"),
                Token::Symbol("=="),
                Token::String("prod"),
                Token::Symbol(")"),
                Token::Word("and"),
                Token::Path("$.code"),
                Token::Symbol("!="),
                Token::String("ok"),
            ]
        );
    }

    #[test]
    fn lex_env_call() {
        assert_eq!(
            tokens("env('HOSTNAME') == $resource.host"),
            vec![
                Token::Word("env"),
                Token::Symbol("("),
                Token::String("HOSTNAME"),
                Token::Symbol(")"),
                Token::Symbol("=="),
                Token::Path("$resource.host"),
            ]
        );
    }

    #[test]
    fn unterminated_string_errors() {
        let mut lexer = Lexer::new("'oops");
        assert!(lexer.next().unwrap().is_err());
    }
}
