//! A reference tokenizer/parser producing `ast::Node` trees for the demo
//! binary and the black-box tests.
//!
//! Per spec.md §1/§6 the parser is an external collaborator the engine
//! never owns; this module is a stand-in, not a POSIX-complete grammar. It
//! covers simple commands, pipelines, `&&`/`||`/`;` sequencing, backgrounding
//! with `&`, the handful of redirection forms the dispatcher already knows
//! how to apply, and the `if`/`while`/`until`/`for`/`case`/`select`/function
//! compound forms (spec.md §4.6). Reserved words are only recognised where a
//! new statement may start (right after a separator); quoting a reserved
//! word to suppress that recognition, full `$(...)`/backtick substitution,
//! and real heredocs (`<<`) are out of scope — the errors this parser raises
//! name the construct it won't handle rather than silently mis-parsing it.

use crate::ast::{
    CaseArm, ChainEntry, Connector, Node, NodeKind, Pipeline, RedirectTarget, Redirection,
    SimpleCommand, Word, WordSegment,
};

/// Prefix on a parse error that means "not wrong, just not finished yet" —
/// the caller should read another line and retry rather than report a
/// syntax error (spec.md §6 "a parser that can express mid-construct state").
pub const INCOMPLETE_PREFIX: &str = "jsh: parse error: incomplete: ";

const LIST_TERMINATORS: &[&str] =
    &["then", "do", "fi", "done", "esac", "else", "elif", ")", "}"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Pipe,
    And,
    Or,
    Semicolon,
    Background,
    RedirectOut { fd: i32, append: bool },
    RedirectIn { fd: i32 },
    RedirectDup { fd: i32, target: i32 },
    HereString { fd: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CharClass {
    Normal,
    InWord,
    InDoubleQuote,
    InSingleQuote,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut state = CharClass::Normal;
    let mut chars = input.chars().peekable();
    let mut pending_fd: Option<i32> = None;

    while let Some(ch) = chars.next() {
        match (&state, ch) {
            (CharClass::Normal | CharClass::InWord, '"') => {
                state = CharClass::InDoubleQuote;
            }
            (CharClass::Normal | CharClass::InWord, '\'') => {
                state = CharClass::InSingleQuote;
            }
            (CharClass::Normal | CharClass::InWord, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                state = CharClass::InWord;
            }
            (CharClass::InDoubleQuote, '"') => state = CharClass::InWord,
            (CharClass::InDoubleQuote, '\\') => match chars.peek() {
                Some(&'"' | &'\\' | &'$' | &'`') => current.push(chars.next().unwrap()),
                _ => current.push('\\'),
            },
            (CharClass::InDoubleQuote, c) => current.push(c),
            (CharClass::InSingleQuote, '\'') => state = CharClass::InWord,
            (CharClass::InSingleQuote, c) => current.push(c),

            (CharClass::Normal | CharClass::InWord, ' ' | '\t') => {
                if !current.is_empty() {
                    tokens.push(Token::Word(std::mem::take(&mut current)));
                }
                state = CharClass::Normal;
            }
            (CharClass::Normal | CharClass::InWord, '|') => {
                if !current.is_empty() {
                    tokens.push(Token::Word(std::mem::take(&mut current)));
                }
                if chars.peek() == Some(&'|') {
                    chars.next();
                    tokens.push(Token::Or);
                } else {
                    tokens.push(Token::Pipe);
                }
                state = CharClass::Normal;
            }
            (CharClass::Normal | CharClass::InWord, '&') => {
                if !current.is_empty() {
                    tokens.push(Token::Word(std::mem::take(&mut current)));
                }
                if chars.peek() == Some(&'&') {
                    chars.next();
                    tokens.push(Token::And);
                } else {
                    tokens.push(Token::Background);
                }
                state = CharClass::Normal;
            }
            (CharClass::Normal | CharClass::InWord, ';' | '\n') => {
                if !current.is_empty() {
                    tokens.push(Token::Word(std::mem::take(&mut current)));
                }
                tokens.push(Token::Semicolon);
                state = CharClass::Normal;
            }
            (CharClass::Normal | CharClass::InWord, '>') => {
                if !current.is_empty() {
                    if let Ok(fd) = current.parse::<i32>() {
                        pending_fd = Some(fd);
                        current.clear();
                    } else {
                        tokens.push(Token::Word(std::mem::take(&mut current)));
                    }
                }
                let fd = pending_fd.take().unwrap_or(1);
                if chars.peek() == Some(&'>') {
                    chars.next();
                    tokens.push(Token::RedirectOut { fd, append: true });
                } else if chars.peek() == Some(&'&') {
                    chars.next();
                    let mut target_str = String::new();
                    while let Some(c) = chars.peek() {
                        if c.is_ascii_digit() {
                            target_str.push(*c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    let target = target_str.parse::<i32>().map_err(|_| "jsh: parse error: malformed fd duplication".to_string())?;
                    tokens.push(Token::RedirectDup { fd, target });
                } else {
                    tokens.push(Token::RedirectOut { fd, append: false });
                }
                state = CharClass::Normal;
            }
            (CharClass::Normal | CharClass::InWord, '<') => {
                if !current.is_empty() {
                    if let Ok(fd) = current.parse::<i32>() {
                        pending_fd = Some(fd);
                        current.clear();
                    } else {
                        tokens.push(Token::Word(std::mem::take(&mut current)));
                    }
                }
                let fd = pending_fd.take().unwrap_or(0);
                if chars.peek() == Some(&'<') {
                    chars.next();
                    if chars.peek() == Some(&'<') {
                        chars.next();
                        tokens.push(Token::HereString { fd });
                    } else {
                        return Err("jsh: parse error: here-documents are not supported by the reference parser".to_string());
                    }
                } else {
                    tokens.push(Token::RedirectIn { fd });
                }
                state = CharClass::Normal;
            }
            (CharClass::Normal | CharClass::InWord, c) => {
                current.push(c);
                state = CharClass::InWord;
            }
        }
    }

    if !current.is_empty() {
        tokens.push(Token::Word(current));
    }

    if matches!(state, CharClass::InDoubleQuote | CharClass::InSingleQuote) {
        return Err(format!("{INCOMPLETE_PREFIX}unterminated quote"));
    }

    Ok(tokens)
}

fn word_from_str(s: &str) -> Word {
    vec![WordSegment::Unquoted(s.to_string())]
}

/// Parse one (possibly multi-line, `\n`-joined) source buffer into a single
/// top-level node. A `None` result means the buffer held only whitespace. An
/// `Err` whose text starts with [`INCOMPLETE_PREFIX`] means the buffer ends
/// mid-construct (unterminated quote, or an `if`/`do`/`case`/brace/paren
/// still waiting on its closer) — the caller should read another line and
/// append it rather than report a syntax error (spec.md §6).
pub fn parse_line(input: &str, line_no: u32) -> Result<Option<Node>, String> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Ok(None);
    }

    let (nodes, consumed) = parse_list(&tokens, 0)?;
    if consumed != tokens.len() {
        return Err(format!("jsh: parse error: unexpected token {:?}", tokens[consumed]));
    }
    if nodes.is_empty() {
        return Ok(None);
    }
    if nodes.len() == 1 {
        let mut only = nodes.into_iter().next().unwrap();
        only.line = line_no;
        return Ok(Some(only));
    }
    Ok(Some(Node::new(NodeKind::List(nodes), line_no)))
}

fn peek_word<'a>(tokens: &'a [Token], idx: usize) -> Option<&'a str> {
    match tokens.get(idx) {
        Some(Token::Word(w)) => Some(w.as_str()),
        _ => None,
    }
}

fn at_list_end(tokens: &[Token], idx: usize) -> bool {
    idx >= tokens.len() || peek_word(tokens, idx).map(|w| LIST_TERMINATORS.contains(&w)).unwrap_or(false)
}

fn expect_word(tokens: &[Token], idx: usize, kw: &str) -> Result<usize, String> {
    match tokens.get(idx) {
        Some(Token::Word(w)) if w == kw => Ok(idx + 1),
        Some(other) => Err(format!("jsh: parse error: expected '{kw}', found {other:?}")),
        None => Err(format!("{INCOMPLETE_PREFIX}expected '{kw}'")),
    }
}

fn is_function_header(w: &str) -> bool {
    w.len() > 2 && w.ends_with("()") && is_assignment_name(&w[..w.len() - 2])
}

/// A sequence of statements, stopping at a list-terminating reserved word or
/// end of input — the building block every compound-command body reduces to.
fn parse_list(tokens: &[Token], start: usize) -> Result<(Vec<Node>, usize), String> {
    let mut idx = start;
    let mut nodes = Vec::new();
    loop {
        while matches!(tokens.get(idx), Some(Token::Semicolon) | Some(Token::Background)) {
            idx += 1;
        }
        if at_list_end(tokens, idx) {
            break;
        }
        let (node, next) = parse_statement(tokens, idx)?;
        idx = next;
        nodes.push(node);
        if matches!(tokens.get(idx), Some(Token::Semicolon) | Some(Token::Background)) {
            continue;
        }
        break;
    }
    Ok((nodes, idx))
}

fn parse_statement(tokens: &[Token], idx: usize) -> Result<(Node, usize), String> {
    match peek_word(tokens, idx) {
        Some("if") => parse_if(tokens, idx),
        Some("while") => parse_while(tokens, idx, false),
        Some("until") => parse_while(tokens, idx, true),
        Some("for") => parse_for(tokens, idx),
        Some("case") => parse_case(tokens, idx),
        Some("select") => parse_select(tokens, idx),
        Some("function") => parse_function_keyword(tokens, idx),
        Some("{") => parse_brace_group(tokens, idx),
        Some("(") => parse_subshell(tokens, idx),
        Some(w) if is_function_header(w) => parse_function_header(tokens, idx),
        _ => parse_and_or(tokens, idx),
    }
}

fn parse_if(tokens: &[Token], start: usize) -> Result<(Node, usize), String> {
    let mut idx = expect_word(tokens, start, "if")?;
    let mut branches = Vec::new();
    loop {
        let (cond, next) = parse_list(tokens, idx)?;
        idx = expect_word(tokens, next, "then")?;
        let (body, next2) = parse_list(tokens, idx)?;
        idx = next2;
        branches.push((cond, body));
        if peek_word(tokens, idx) == Some("elif") {
            idx += 1;
            continue;
        }
        break;
    }
    let else_branch = if peek_word(tokens, idx) == Some("else") {
        idx += 1;
        let (body, next) = parse_list(tokens, idx)?;
        idx = next;
        Some(body)
    } else {
        None
    };
    idx = expect_word(tokens, idx, "fi")?;
    Ok((Node::new(NodeKind::If { branches, else_branch }, 0), idx))
}

fn parse_while(tokens: &[Token], start: usize, until: bool) -> Result<(Node, usize), String> {
    let kw = if until { "until" } else { "while" };
    let mut idx = expect_word(tokens, start, kw)?;
    let (cond, next) = parse_list(tokens, idx)?;
    idx = expect_word(tokens, next, "do")?;
    let (body, next2) = parse_list(tokens, idx)?;
    idx = expect_word(tokens, next2, "done")?;
    let kind = if until { NodeKind::Until { cond, body } } else { NodeKind::While { cond, body } };
    Ok((Node::new(kind, 0), idx))
}

fn parse_for(tokens: &[Token], start: usize) -> Result<(Node, usize), String> {
    let mut idx = expect_word(tokens, start, "for")?;
    let var = match peek_word(tokens, idx) {
        Some(w) if is_assignment_name(w) => w.to_string(),
        Some(_) => return Err("jsh: parse error: 'for' requires a variable name".to_string()),
        None => return Err(format!("{INCOMPLETE_PREFIX}'for' requires a variable name")),
    };
    idx += 1;

    let mut words = Vec::new();
    if peek_word(tokens, idx) == Some("in") {
        idx += 1;
        while let Some(Token::Word(w)) = tokens.get(idx) {
            if LIST_TERMINATORS.contains(&w.as_str()) {
                break;
            }
            words.push(word_from_str(w));
            idx += 1;
        }
    }
    if matches!(tokens.get(idx), Some(Token::Semicolon)) {
        idx += 1;
    }
    idx = expect_word(tokens, idx, "do")?;
    let (body, next) = parse_list(tokens, idx)?;
    idx = expect_word(tokens, next, "done")?;
    Ok((Node::new(NodeKind::For { var, words, body }, 0), idx))
}

fn parse_select(tokens: &[Token], start: usize) -> Result<(Node, usize), String> {
    let mut idx = expect_word(tokens, start, "select")?;
    let var = match peek_word(tokens, idx) {
        Some(w) if is_assignment_name(w) => w.to_string(),
        Some(_) => return Err("jsh: parse error: 'select' requires a variable name".to_string()),
        None => return Err(format!("{INCOMPLETE_PREFIX}'select' requires a variable name")),
    };
    idx += 1;

    let mut words = Vec::new();
    if peek_word(tokens, idx) == Some("in") {
        idx += 1;
        while let Some(Token::Word(w)) = tokens.get(idx) {
            if LIST_TERMINATORS.contains(&w.as_str()) {
                break;
            }
            words.push(word_from_str(w));
            idx += 1;
        }
    }
    if matches!(tokens.get(idx), Some(Token::Semicolon)) {
        idx += 1;
    }
    idx = expect_word(tokens, idx, "do")?;
    let (body, next) = parse_list(tokens, idx)?;
    idx = expect_word(tokens, next, "done")?;
    Ok((Node::new(NodeKind::Select { var, words, body }, 0), idx))
}

/// `case WORD in [(]PATTERN[|PATTERN]*) body ;; ... esac`. The reference
/// tokenizer doesn't special-case `(`/`)`, so a pattern like `foo)` only
/// splits out its closing paren here, by trimming the token text directly.
fn parse_case(tokens: &[Token], start: usize) -> Result<(Node, usize), String> {
    let mut idx = expect_word(tokens, start, "case")?;
    let subject = match tokens.get(idx) {
        Some(Token::Word(w)) => {
            idx += 1;
            word_from_str(w)
        }
        Some(_) => return Err("jsh: parse error: 'case' requires a subject word".to_string()),
        None => return Err(format!("{INCOMPLETE_PREFIX}'case' requires a subject word")),
    };
    idx = expect_word(tokens, idx, "in")?;
    while matches!(tokens.get(idx), Some(Token::Semicolon)) {
        idx += 1;
    }

    let mut arms = Vec::new();
    loop {
        if peek_word(tokens, idx) == Some("esac") {
            break;
        }
        if idx >= tokens.len() {
            return Err(format!("{INCOMPLETE_PREFIX}expected 'esac'"));
        }

        let mut patterns = Vec::new();
        loop {
            match tokens.get(idx) {
                Some(Token::Word(raw)) => {
                    let mut text = raw.as_str();
                    if patterns.is_empty() {
                        text = text.strip_prefix('(').unwrap_or(text);
                    }
                    if let Some(pat) = text.strip_suffix(')') {
                        patterns.push(word_from_str(pat));
                        idx += 1;
                        break;
                    }
                    patterns.push(word_from_str(text));
                    idx += 1;
                    if matches!(tokens.get(idx), Some(Token::Pipe)) {
                        idx += 1;
                        continue;
                    }
                    return Err("jsh: parse error: expected ')' after case pattern".to_string());
                }
                Some(_) => return Err("jsh: parse error: malformed case pattern".to_string()),
                None => return Err(format!("{INCOMPLETE_PREFIX}malformed case pattern")),
            }
        }

        while matches!(tokens.get(idx), Some(Token::Semicolon)) {
            idx += 1;
        }
        let (body, next) = parse_case_body(tokens, idx)?;
        idx = next;
        arms.push(CaseArm { patterns, body });
    }

    idx = expect_word(tokens, idx, "esac")?;
    Ok((Node::new(NodeKind::Case { subject, arms }, 0), idx))
}

/// A case arm's body ends at `;;`, at `esac` (last arm may omit `;;`), or at
/// end of input (incomplete). Ordinary single `;` just separates statements
/// within the arm, same as everywhere else.
fn parse_case_body(tokens: &[Token], start: usize) -> Result<(Vec<Node>, usize), String> {
    let mut idx = start;
    let mut nodes = Vec::new();
    loop {
        while matches!(tokens.get(idx), Some(Token::Semicolon)) {
            if matches!(tokens.get(idx + 1), Some(Token::Semicolon)) {
                return Ok((nodes, idx + 2));
            }
            idx += 1;
        }
        if peek_word(tokens, idx) == Some("esac") || idx >= tokens.len() {
            return Ok((nodes, idx));
        }
        let (node, next) = parse_statement(tokens, idx)?;
        idx = next;
        nodes.push(node);
    }
}

fn parse_brace_group(tokens: &[Token], start: usize) -> Result<(Node, usize), String> {
    let idx = expect_word(tokens, start, "{")?;
    let (body, next) = parse_list(tokens, idx)?;
    let idx = expect_word(tokens, next, "}")?;
    Ok((Node::new(NodeKind::BraceGroup(body), 0), idx))
}

fn parse_subshell(tokens: &[Token], start: usize) -> Result<(Node, usize), String> {
    let idx = expect_word(tokens, start, "(")?;
    let (body, next) = parse_list(tokens, idx)?;
    let idx = expect_word(tokens, next, ")")?;
    Ok((Node::new(NodeKind::Subshell(body), 0), idx))
}

fn function_body(tokens: &[Token], idx: usize) -> Result<(Vec<Node>, usize), String> {
    let (node, next) = parse_statement(tokens, idx)?;
    let body = match node.kind {
        NodeKind::BraceGroup(b) | NodeKind::Subshell(b) => b,
        other => vec![Node::new(other, node.line)],
    };
    Ok((body, next))
}

/// `name() compound-command` — the common glued-together POSIX spelling.
fn parse_function_header(tokens: &[Token], start: usize) -> Result<(Node, usize), String> {
    let name = match tokens.get(start) {
        Some(Token::Word(w)) => w[..w.len() - 2].to_string(),
        _ => unreachable!("dispatched only when is_function_header matched"),
    };
    let (body, next) = function_body(tokens, start + 1)?;
    Ok((Node::new(NodeKind::FunctionDef { name, body: std::rc::Rc::new(body) }, 0), next))
}

/// `function name [()] compound-command` — the ksh/bash keyword spelling.
fn parse_function_keyword(tokens: &[Token], start: usize) -> Result<(Node, usize), String> {
    let idx = expect_word(tokens, start, "function")?;
    let name = match peek_word(tokens, idx) {
        Some(w) => w.trim_end_matches("()").to_string(),
        None => return Err(format!("{INCOMPLETE_PREFIX}'function' requires a name")),
    };
    let (body, next) = function_body(tokens, idx + 1)?;
    Ok((Node::new(NodeKind::FunctionDef { name, body: std::rc::Rc::new(body) }, 0), next))
}

fn parse_and_or(tokens: &[Token], start: usize) -> Result<(Node, usize), String> {
    let mut idx = start;
    let mut entries: Vec<ChainEntry> = Vec::new();
    let mut pending_connector = Connector::Sequence;
    loop {
        let (pipeline, consumed) = parse_pipeline(&tokens[idx..])?;
        idx += consumed;
        entries.push(ChainEntry { pipeline, connector: pending_connector });
        match tokens.get(idx) {
            Some(Token::And) => {
                pending_connector = Connector::And;
                idx += 1;
            }
            Some(Token::Or) => {
                pending_connector = Connector::Or;
                idx += 1;
            }
            _ => break,
        }
    }
    let background = matches!(tokens.get(idx), Some(Token::Background));
    if background {
        idx += 1;
    }
    Ok((Node::new(NodeKind::AndOrList { chain: entries, background }, 0), idx))
}

fn parse_pipeline(tokens: &[Token]) -> Result<(Pipeline, usize), String> {
    let mut negate = false;
    let mut idx = 0;

    if let Some(Token::Word(w)) = tokens.first() {
        if w == "!" {
            negate = true;
            idx += 1;
        }
    }

    let mut stages = Vec::new();
    loop {
        let (stage, consumed) = parse_simple_command(&tokens[idx..])?;
        idx += consumed;
        stages.push(stage);
        if tokens.get(idx) == Some(&Token::Pipe) {
            idx += 1;
            continue;
        }
        break;
    }

    Ok((Pipeline { negate, stages }, idx))
}

fn parse_simple_command(tokens: &[Token]) -> Result<(SimpleCommand, usize), String> {
    let mut words = Vec::new();
    let mut assignments = Vec::new();
    let mut redirections = Vec::new();
    let mut idx = 0;

    while idx < tokens.len() {
        match &tokens[idx] {
            Token::Word(w) => {
                if words.is_empty() {
                    if let Some((name, value)) = w.split_once('=') {
                        if is_assignment_name(name) {
                            assignments.push((name.to_string(), word_from_str(value)));
                            idx += 1;
                            continue;
                        }
                    }
                }
                words.push(word_from_str(w));
                idx += 1;
            }
            Token::RedirectOut { fd, append } => {
                idx += 1;
                let target = take_word(tokens, &mut idx)?;
                let rt = if *append { RedirectTarget::FileAppend(target) } else { RedirectTarget::File(target) };
                redirections.push(Redirection { fd: *fd, target: rt });
            }
            Token::RedirectIn { fd } => {
                idx += 1;
                let target = take_word(tokens, &mut idx)?;
                redirections.push(Redirection { fd: *fd, target: RedirectTarget::FileRead(target) });
            }
            Token::RedirectDup { fd, target } => {
                idx += 1;
                redirections.push(Redirection { fd: *fd, target: RedirectTarget::Fd(*target) });
            }
            Token::HereString { fd } => {
                idx += 1;
                let target = take_word(tokens, &mut idx)?;
                redirections.push(Redirection { fd: *fd, target: RedirectTarget::HereString(target) });
            }
            Token::Pipe | Token::And | Token::Or | Token::Semicolon | Token::Background => break,
        }
    }

    Ok((SimpleCommand { assignments, words, redirections }, idx))
}

fn take_word(tokens: &[Token], idx: &mut usize) -> Result<Word, String> {
    match tokens.get(*idx) {
        Some(Token::Word(w)) => {
            *idx += 1;
            Ok(word_from_str(w))
        }
        _ => Err("jsh: parse error: redirection requires a target word".to_string()),
    }
}

fn is_assignment_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_len(node: &Node) -> usize {
        match &node.kind {
            NodeKind::AndOrList { chain, .. } => chain.len(),
            _ => panic!("expected AndOrList"),
        }
    }

    #[test]
    fn parses_simple_command() {
        let node = parse_line("echo hello world", 1).unwrap().unwrap();
        assert_eq!(chain_len(&node), 1);
    }

    #[test]
    fn parses_pipeline() {
        let node = parse_line("echo hi | sort | uniq", 1).unwrap().unwrap();
        match &node.kind {
            NodeKind::AndOrList { chain, .. } => assert_eq!(chain[0].pipeline.stages.len(), 3),
            _ => panic!(),
        }
    }

    #[test]
    fn parses_and_or_sequence() {
        let node = parse_line("true && echo yes || echo no", 1).unwrap().unwrap();
        assert_eq!(chain_len(&node), 3);
    }

    #[test]
    fn trailing_ampersand_marks_background() {
        let node = parse_line("sleep 1 &", 1).unwrap().unwrap();
        match &node.kind {
            NodeKind::AndOrList { background, .. } => assert!(*background),
            _ => panic!(),
        }
    }

    #[test]
    fn leading_assignment_is_separated_from_words() {
        let node = parse_line("FOO=bar echo hi", 1).unwrap().unwrap();
        match &node.kind {
            NodeKind::AndOrList { chain, .. } => {
                let cmd = &chain[0].pipeline.stages[0];
                assert_eq!(cmd.assignments.len(), 1);
                assert_eq!(cmd.words.len(), 1);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn empty_line_is_none() {
        assert!(parse_line("   ", 1).unwrap().is_none());
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        let err = parse_line("echo \"unterminated", 1).unwrap_err();
        assert!(err.starts_with(INCOMPLETE_PREFIX));
    }

    #[test]
    fn parses_if_then_fi_on_one_line() {
        let node = parse_line("if true; then echo yes; fi", 1).unwrap().unwrap();
        match &node.kind {
            NodeKind::If { branches, else_branch } => {
                assert_eq!(branches.len(), 1);
                assert!(else_branch.is_none());
            }
            _ => panic!("expected If, got {node:?}"),
        }
    }

    #[test]
    fn if_without_fi_is_incomplete() {
        let err = parse_line("if true; then echo yes", 1).unwrap_err();
        assert!(err.starts_with(INCOMPLETE_PREFIX), "got: {err}");
    }

    #[test]
    fn parses_if_elif_else() {
        let node = parse_line("if false; then echo a; elif true; then echo b; else echo c; fi", 1)
            .unwrap()
            .unwrap();
        match &node.kind {
            NodeKind::If { branches, else_branch } => {
                assert_eq!(branches.len(), 2);
                assert!(else_branch.is_some());
            }
            _ => panic!(),
        }
    }

    #[test]
    fn parses_while_done() {
        let node = parse_line("while true; do echo spin; done", 1).unwrap().unwrap();
        assert!(matches!(node.kind, NodeKind::While { .. }));
    }

    #[test]
    fn parses_until_done() {
        let node = parse_line("until false; do echo spin; done", 1).unwrap().unwrap();
        assert!(matches!(node.kind, NodeKind::Until { .. }));
    }

    #[test]
    fn parses_for_in_done() {
        let node = parse_line("for x in a b c; do echo $x; done", 1).unwrap().unwrap();
        match &node.kind {
            NodeKind::For { var, words, .. } => {
                assert_eq!(var, "x");
                assert_eq!(words.len(), 3);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn parses_case_with_multiple_arms() {
        let node = parse_line("case $x in foo) echo a ;; bar|baz) echo b ;; esac", 1).unwrap().unwrap();
        match &node.kind {
            NodeKind::Case { arms, .. } => {
                assert_eq!(arms.len(), 2);
                assert_eq!(arms[1].patterns.len(), 2);
            }
            _ => panic!("expected Case, got {node:?}"),
        }
    }

    #[test]
    fn parses_select_in_done() {
        let node = parse_line("select x in a b; do echo $x; done", 1).unwrap().unwrap();
        assert!(matches!(node.kind, NodeKind::Select { .. }));
    }

    #[test]
    fn parses_brace_group() {
        let node = parse_line("{ echo a; echo b; }", 1).unwrap().unwrap();
        match &node.kind {
            NodeKind::BraceGroup(body) => assert_eq!(body.len(), 2),
            _ => panic!(),
        }
    }

    #[test]
    fn parses_subshell() {
        let node = parse_line("( echo a; echo b )", 1).unwrap().unwrap();
        match &node.kind {
            NodeKind::Subshell(body) => assert_eq!(body.len(), 2),
            _ => panic!(),
        }
    }

    #[test]
    fn parses_glued_function_definition() {
        let node = parse_line("greet() { echo hi; }", 1).unwrap().unwrap();
        match &node.kind {
            NodeKind::FunctionDef { name, body } => {
                assert_eq!(name, "greet");
                assert_eq!(body.len(), 1);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn parses_function_keyword_form() {
        let node = parse_line("function greet { echo hi; }", 1).unwrap().unwrap();
        assert!(matches!(node.kind, NodeKind::FunctionDef { .. }));
    }

    #[test]
    fn multi_line_if_joins_across_newlines() {
        let node = parse_line("if true\nthen\necho yes\nfi", 1).unwrap().unwrap();
        assert!(matches!(node.kind, NodeKind::If { .. }));
    }
}
