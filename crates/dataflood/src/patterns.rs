// A small library of structural patterns the inferrer can pin onto a
// string field, and a generator for the regex subset those patterns (and
// user-authored model patterns) are written in: literals, character
// classes and ranges, `\d`/`\w`/`\s`, groups with alternation, and the
// `{n}`/`{n,m}`/`?`/`+`/`*` quantifiers.

use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;

lazy_static! {
    static ref PATTERN_LIBRARY: Vec<(&'static str, Regex)> = [
        r"^\d{3}-\d{3}-\d{4}$",        // phone
        r"^\d{3}-\d{2}-\d{4}$",        // ssn
        r"^\d{5}(-\d{4})?$",           // zip
        r"^[A-Z]{2,4}-\d{3,5}$",       // product code
        r"^#[0-9a-fA-F]{6}$",          // hex color
        r"^[A-Z]{3}\d{6}$",            // ticket id
        r"^\+\d{1,3}-\d{3,12}$",       // international phone
    ]
    .into_iter()
    .map(|p| (p, Regex::new(p).expect("is a valid regex")))
    .collect();
}

/// Find a library pattern matched by every value. Requires at least three
/// values so a couple of coincidental strings don't pin a pattern.
pub fn detect(values: &[&str]) -> Option<&'static str> {
    if values.len() < 3 {
        return None;
    }
    PATTERN_LIBRARY
        .iter()
        .find(|(_, re)| values.iter().all(|v| re.is_match(v)))
        .map(|(pattern, _)| *pattern)
}

/// Generate a string matching `pattern`, or None when the pattern uses
/// syntax outside the supported subset.
pub fn generate(pattern: &str, rng: &mut impl Rng) -> Option<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut parser = Parser { chars, at: 0 };
    let node = parser.parse_alternatives(true)?;
    if parser.at != parser.chars.len() {
        return None;
    }
    let mut out = String::new();
    realize(&node, rng, &mut out);
    Some(out)
}

// Parsed pattern AST.
enum Node {
    Sequence(Vec<Node>),
    Alternatives(Vec<Node>),
    Literal(char),
    Class(Vec<(char, char)>),
    Repeat(Box<Node>, usize, usize),
}

struct Parser {
    chars: Vec<char>,
    at: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.at).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.at += 1;
        Some(c)
    }

    fn parse_alternatives(&mut self, top: bool) -> Option<Node> {
        let mut branches = vec![self.parse_sequence(top)?];
        while self.peek() == Some('|') {
            self.bump();
            branches.push(self.parse_sequence(top)?);
        }
        Some(if branches.len() == 1 {
            branches.pop().unwrap()
        } else {
            Node::Alternatives(branches)
        })
    }

    fn parse_sequence(&mut self, top: bool) -> Option<Node> {
        let mut nodes = Vec::new();
        loop {
            match self.peek() {
                None | Some('|') => break,
                Some(')') if !top => break,
                Some(')') => return None,
                _ => {}
            }
            let atom = self.parse_atom()?;
            nodes.push(self.parse_quantifier(atom)?);
        }
        Some(Node::Sequence(nodes))
    }

    fn parse_atom(&mut self) -> Option<Node> {
        match self.bump()? {
            // Anchors constrain matching, not generation.
            '^' | '$' => Some(Node::Sequence(vec![])),
            '.' => Some(Node::Class(vec![('a', 'z'), ('A', 'Z'), ('0', '9')])),
            '\\' => self.parse_escape(),
            '[' => self.parse_class(),
            '(' => {
                // Non-capturing prefix is accepted and ignored.
                if self.peek() == Some('?') {
                    self.bump();
                    if self.bump() != Some(':') {
                        return None;
                    }
                }
                let inner = self.parse_alternatives(false)?;
                if self.bump() != Some(')') {
                    return None;
                }
                Some(inner)
            }
            c if "+*?{}".contains(c) => None,
            c => Some(Node::Literal(c)),
        }
    }

    fn parse_escape(&mut self) -> Option<Node> {
        Some(match self.bump()? {
            'd' => Node::Class(vec![('0', '9')]),
            'w' => Node::Class(vec![('a', 'z'), ('A', 'Z'), ('0', '9'), ('_', '_')]),
            's' => Node::Literal(' '),
            c => Node::Literal(c),
        })
    }

    fn parse_class(&mut self) -> Option<Node> {
        let mut ranges = Vec::new();
        loop {
            match self.bump()? {
                ']' => break,
                // Negated classes are outside the subset.
                '^' if ranges.is_empty() => return None,
                '\\' => match self.bump()? {
                    'd' => ranges.push(('0', '9')),
                    'w' => {
                        ranges.extend([('a', 'z'), ('A', 'Z'), ('0', '9'), ('_', '_')]);
                    }
                    c => ranges.push((c, c)),
                },
                c => {
                    if self.peek() == Some('-') && self.chars.get(self.at + 1) != Some(&']') {
                        self.bump();
                        let end = self.bump()?;
                        if end < c {
                            return None;
                        }
                        ranges.push((c, end));
                    } else {
                        ranges.push((c, c));
                    }
                }
            }
        }
        Some(Node::Class(ranges))
    }

    fn parse_quantifier(&mut self, atom: Node) -> Option<Node> {
        match self.peek() {
            Some('{') => {
                self.bump();
                let mut min = String::new();
                while self.peek().map_or(false, |c| c.is_ascii_digit()) {
                    min.push(self.bump()?);
                }
                let min: usize = min.parse().ok()?;
                let max = match self.bump()? {
                    '}' => min,
                    ',' => {
                        let mut max = String::new();
                        while self.peek().map_or(false, |c| c.is_ascii_digit()) {
                            max.push(self.bump()?);
                        }
                        if self.bump() != Some('}') {
                            return None;
                        }
                        // Open-ended `{n,}` caps at a small bound.
                        max.parse().unwrap_or(min + 3)
                    }
                    _ => return None,
                };
                Some(Node::Repeat(Box::new(atom), min, max))
            }
            Some('?') => {
                self.bump();
                Some(Node::Repeat(Box::new(atom), 0, 1))
            }
            Some('+') => {
                self.bump();
                Some(Node::Repeat(Box::new(atom), 1, 3))
            }
            Some('*') => {
                self.bump();
                Some(Node::Repeat(Box::new(atom), 0, 3))
            }
            _ => Some(atom),
        }
    }
}

fn realize(node: &Node, rng: &mut impl Rng, out: &mut String) {
    match node {
        Node::Sequence(nodes) => {
            for n in nodes {
                realize(n, rng, out);
            }
        }
        Node::Alternatives(branches) => {
            realize(&branches[rng.gen_range(0..branches.len())], rng, out)
        }
        Node::Literal(c) => out.push(*c),
        Node::Class(ranges) => {
            let total: u32 = ranges
                .iter()
                .map(|(lo, hi)| *hi as u32 - *lo as u32 + 1)
                .sum();
            let mut pick = rng.gen_range(0..total.max(1));
            for (lo, hi) in ranges {
                let span = *hi as u32 - *lo as u32 + 1;
                if pick < span {
                    out.push(char::from_u32(*lo as u32 + pick).unwrap_or(*lo));
                    return;
                }
                pick -= span;
            }
        }
        Node::Repeat(inner, min, max) => {
            let count = if min >= max {
                *min
            } else {
                rng.gen_range(*min..=*max)
            };
            for _ in 0..count {
                realize(inner, rng, out);
            }
        }
    }
}
