use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("unterminated quote in message")]
    UnterminatedQuote,
    #[error("trailing backslash in message")]
    TrailingEscape,
}

/// Tokenizes a chat message into command arguments.
///
/// Splits on whitespace while respecting single quotes, double quotes and
/// backslash escapes, so `deploy "my app" --env 'pre prod'` yields four
/// tokens. An empty message yields an empty vector.
pub fn parse(text: &str) -> Result<Vec<String>, ParseError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_word = false;

    let mut chars = text.chars();
    loop {
        let c = match chars.next() {
            Some(c) => c,
            None => break,
        };
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => return Err(ParseError::UnterminatedQuote),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => return Err(ParseError::UnterminatedQuote),
                        },
                        Some(inner) => current.push(inner),
                        None => return Err(ParseError::UnterminatedQuote),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => return Err(ParseError::TrailingEscape),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    tokens.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        tokens.push(current);
    }

    Ok(tokens)
}
