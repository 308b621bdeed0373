// Document generation: sample one document from a model under an optional
// (seed, entropy) pair, optionally narrowed by per-field constraints
// derived from a query. All randomness flows through a seeded StdRng
// passed down the call stack, so a seeded generation is fully
// reproducible for an identical model.

use super::model::{Branch, Kind, Model};
use super::string_model::{classify, StringModel};
use super::{patterns, Format};
use bson::Value;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::BTreeMap;

/// Per-field guidance derived from query operators: `$eq` pins a value,
/// `$gt`/`$lt` bound numerics, `$in` restricts to a set, `$nin` excludes.
#[derive(Clone, Debug, Default)]
pub struct Constraint {
    pub equals: Option<serde_json::Value>,
    pub minimum: Option<f64>,
    pub exclusive_minimum: bool,
    pub maximum: Option<f64>,
    pub exclusive_maximum: bool,
    pub one_of: Vec<serde_json::Value>,
    pub not_in: Vec<serde_json::Value>,
}

impl Constraint {
    pub fn equals(value: serde_json::Value) -> Self {
        Self {
            equals: Some(value),
            ..Self::default()
        }
    }

    fn excludes(&self, value: &Value) -> bool {
        if self.not_in.is_empty() {
            return false;
        }
        let json = bson::value_to_json(value);
        self.not_in.contains(&json)
    }
}

#[derive(Clone, Debug, Default)]
pub struct GenerateOptions {
    pub seed: Option<u64>,
    /// Overrides every string model's effective entropy when set.
    pub entropy: Option<f64>,
    /// Keyed by dotted field path from the document root.
    pub constraints: BTreeMap<String, Constraint>,
}

pub struct Generator<'m> {
    model: &'m Model,
    options: GenerateOptions,
}

impl<'m> Generator<'m> {
    pub fn new(model: &'m Model, options: GenerateOptions) -> Self {
        Self { model, options }
    }

    /// Generate the `index`-th document of a result set. Seeded runs
    /// derive a per-document seed from the base seed and index, so any
    /// position is reproducible independently.
    pub fn generate_nth(&self, index: u64) -> Value {
        match self.options.seed {
            Some(seed) => {
                let doc_seed = seed.wrapping_add(index);
                let mut rng = StdRng::seed_from_u64(doc_seed);
                self.node(self.model, &mut rng, Some(doc_seed), "")
            }
            None => {
                let mut rng = StdRng::from_entropy();
                self.node(self.model, &mut rng, None, "")
            }
        }
    }

    pub fn generate_many(&self, count: usize) -> Vec<Value> {
        (0..count as u64).map(|i| self.generate_nth(i)).collect()
    }

    fn node(&self, model: &Model, rng: &mut StdRng, seed: Option<u64>, path: &str) -> Value {
        let constraint = self.options.constraints.get(path);

        if let Some(c) = constraint {
            if let Some(equals) = &c.equals {
                return bson::json_to_value(equals);
            }
            if !c.one_of.is_empty() {
                let allowed: Vec<&serde_json::Value> = c
                    .one_of
                    .iter()
                    .filter(|v| !c.not_in.contains(*v))
                    .collect();
                if !allowed.is_empty() {
                    return bson::json_to_value(allowed[rng.gen_range(0..allowed.len())]);
                }
            }
        }

        // Excluded draws retry a few times, then stand as-is.
        let mut value = self.dispatch(model, rng, seed, path);
        if let Some(c) = constraint {
            for _ in 0..8 {
                if !c.excludes(&value) {
                    break;
                }
                value = self.dispatch(model, rng, seed, path);
            }
        }
        value
    }

    fn dispatch(&self, model: &Model, rng: &mut StdRng, seed: Option<u64>, path: &str) -> Value {
        let constraint = self.options.constraints.get(path);
        match model.branch() {
            Branch::Enum(values) => {
                let allowed: Vec<&serde_json::Value> = values
                    .iter()
                    .filter(|v| {
                        constraint.map_or(true, |c| !c.not_in.contains(*v))
                    })
                    .collect();
                if allowed.is_empty() {
                    return Value::Null;
                }
                bson::json_to_value(allowed[rng.gen_range(0..allowed.len())])
            }
            Branch::AnyOf(members) => {
                let member = &members[rng.gen_range(0..members.len())];
                self.dispatch(member, rng, seed, path)
            }
            Branch::Typed(Kind::Object) => self.object(model, rng, seed, path),
            Branch::Typed(Kind::Array) => self.array(model, rng, seed, path),
            Branch::Typed(Kind::String) => Value::String(self.string(model, rng)),
            Branch::Typed(kind @ (Kind::Integer | Kind::Number)) => {
                self.numeric(model, kind, rng, constraint)
            }
            Branch::Typed(Kind::Boolean) => Value::Boolean(rng.gen_bool(0.5)),
            Branch::Typed(Kind::Null) => Value::Null,
        }
    }

    fn object(&self, model: &Model, rng: &mut StdRng, seed: Option<u64>, path: &str) -> Value {
        let mut doc = bson::Document::new();

        for (name, property) in &model.properties {
            let child_path = if path.is_empty() {
                name.clone()
            } else {
                format!("{path}.{name}")
            };

            let required = model.required.iter().any(|r| r == name);
            // A constrained property is always present, else its absence
            // would contradict the query which asked for it.
            let constrained = self.options.constraints.keys().any(|key| {
                key == &child_path || key.starts_with(&format!("{child_path}."))
            });
            if !(required || constrained || rng.gen_bool(0.8)) {
                continue;
            }

            let value = match seed {
                // Sibling fields draw from distinct but stable streams:
                // each derives its seed from the parent's plus the field
                // name's character sum.
                Some(base) => {
                    let child_seed = base.wrapping_add(char_sum(name));
                    let mut child_rng = StdRng::seed_from_u64(child_seed);
                    self.node(property, &mut child_rng, Some(child_seed), &child_path)
                }
                None => self.node(property, rng, None, &child_path),
            };
            doc.insert(name.clone(), value);
        }
        Value::Document(doc)
    }

    fn array(&self, model: &Model, rng: &mut StdRng, seed: Option<u64>, path: &str) -> Value {
        let lo = model.min_items.unwrap_or(1);
        let hi = model.max_items.unwrap_or(5).max(lo);
        let len = if hi > lo { rng.gen_range(lo..=hi) } else { lo };

        let item_model = model.items.as_deref();
        let items = (0..len)
            .map(|_| match item_model {
                Some(m) => self.node(m, rng, seed, path),
                None => Value::Null,
            })
            .collect();
        Value::Array(items)
    }

    fn numeric(
        &self,
        model: &Model,
        kind: Kind,
        rng: &mut StdRng,
        constraint: Option<&Constraint>,
    ) -> Value {
        let integer = kind == Kind::Integer;
        let mut lo = model.minimum.unwrap_or(0.0);
        let mut hi = model.maximum.unwrap_or(100.0);

        if let Some(c) = constraint {
            if let Some(min) = c.minimum {
                lo = lo.max(if c.exclusive_minimum && integer {
                    min + 1.0
                } else {
                    min
                });
            }
            if let Some(max) = c.maximum {
                hi = hi.min(if c.exclusive_maximum && integer {
                    max - 1.0
                } else {
                    max
                });
            }
        }
        if hi < lo {
            hi = lo;
        }

        let mut value = match &model.histogram {
            Some(histogram) => {
                let mut draw = histogram.sample(rng);
                for _ in 0..16 {
                    if (lo..=hi).contains(&draw) {
                        break;
                    }
                    draw = histogram.sample(rng);
                }
                draw.clamp(lo, hi)
            }
            None if hi > lo => rng.gen_range(lo..=hi),
            None => lo,
        };

        if let Some(step) = model.multiple_of {
            if step > 0.0 {
                value = (value / step).round() * step;
                // Snapping may step outside the window; walk back in.
                if value < lo {
                    value += step;
                }
                if value > hi {
                    value -= step;
                }
                value = value.clamp(lo, hi);
            }
        }

        if integer {
            let n = value.floor() as i64;
            if (i32::MIN as i64..=i32::MAX as i64).contains(&n) {
                Value::Int32(n as i32)
            } else {
                Value::Int64(n)
            }
        } else {
            Value::Double(value)
        }
    }

    fn string(&self, model: &Model, rng: &mut StdRng) -> String {
        if let Some(format) = model.format {
            return format.generate(rng);
        }
        if let Some(pattern) = &model.pattern {
            if let Some(s) = patterns::generate(pattern, rng) {
                return s;
            }
        }
        if let Some(string_model) = &model.string_model {
            return self.from_string_model(string_model, model, rng);
        }

        // No learned structure at all: bounded lowercase noise.
        let lo = model.min_length.unwrap_or(5);
        let hi = model.max_length.unwrap_or(10).max(lo);
        let len = if hi > lo { rng.gen_range(lo..=hi) } else { lo };
        (0..len)
            .map(|_| char::from(b'a' + rng.gen_range(0..26u8)))
            .collect()
    }

    fn from_string_model(&self, sm: &StringModel, model: &Model, rng: &mut StdRng) -> String {
        let entropy = self
            .options
            .entropy
            .or(sm.entropy_override)
            .unwrap_or(sm.entropy_score);

        // Low entropy replays observed values; middling entropy replays
        // observed shapes; high entropy stitches novel strings.
        if entropy < 2.0 && !sm.value_frequency.is_empty() {
            if let Some(value) = weighted_key(&sm.value_frequency, rng) {
                return value.to_owned();
            }
        }
        if entropy < 4.0 && !sm.patterns.is_empty() {
            if let Some(class) = weighted_key(&sm.patterns, rng) {
                return self.realize_pattern_class(class, sm, rng);
            }
        }
        self.stitch(sm, model, rng)
    }

    // Realize each class character from the model's own character pools,
    // falling back to the class's ASCII range.
    fn realize_pattern_class(&self, class: &str, sm: &StringModel, rng: &mut StdRng) -> String {
        let mut out = String::new();
        let chars: Vec<char> = class.chars().collect();
        let mut at = 0;

        while at < chars.len() {
            let class_char = chars[at];
            at += 1;

            // Runs are compressed as `c{n}`.
            let mut count = 1;
            if chars.get(at) == Some(&'{') {
                let close = chars[at..].iter().position(|c| *c == '}');
                if let Some(close) = close {
                    let digits: String = chars[at + 1..at + close].iter().collect();
                    if let Ok(n) = digits.parse::<usize>() {
                        count = n;
                        at += close + 1;
                    }
                }
            }
            for _ in 0..count {
                out.push(self.class_char(class_char, sm, rng));
            }
        }
        out
    }

    fn class_char(&self, class: char, sm: &StringModel, rng: &mut StdRng) -> char {
        let pool: Vec<char> = sm
            .unique_characters
            .iter()
            .copied()
            .filter(|c| classify(*c) == class)
            .collect();
        if !pool.is_empty() {
            return pool[rng.gen_range(0..pool.len())];
        }
        match class {
            'd' => char::from(b'0' + rng.gen_range(0..10u8)),
            'U' => char::from(b'A' + rng.gen_range(0..26u8)),
            'L' => char::from(b'a' + rng.gen_range(0..26u8)),
            's' => ' ',
            _ => {
                const PUNCT: &[u8] = b".-_@#/+:";
                char::from(PUNCT[rng.gen_range(0..PUNCT.len())])
            }
        }
    }

    // High-entropy synthesis: seed with a common prefix, extend by n-gram
    // stitching, optionally close with a common suffix.
    fn stitch(&self, sm: &StringModel, model: &Model, rng: &mut StdRng) -> String {
        let lo = model.min_length.unwrap_or(sm.min_length);
        let hi = model.max_length.unwrap_or(sm.max_length).max(lo);
        let target = if hi > lo { rng.gen_range(lo..=hi) } else { lo };
        if target == 0 {
            return String::new();
        }

        let mut out = String::new();
        if let Some(prefix) = weighted_key(&sm.common_prefixes, rng) {
            out.push_str(prefix);
        }

        while out.chars().count() < target {
            let next = self
                .ngram_extension(&out, sm, rng)
                .or_else(|| weighted_probability_key(&sm.character_probability, rng))
                .or_else(|| {
                    if sm.unique_characters.is_empty() {
                        None
                    } else {
                        Some(sm.unique_characters[rng.gen_range(0..sm.unique_characters.len())])
                    }
                })
                .unwrap_or_else(|| char::from(b'a' + rng.gen_range(0..26u8)));
            out.push(next);
        }

        if !sm.common_suffixes.is_empty() && rng.gen_bool(0.3) {
            if let Some(suffix) = weighted_key(&sm.common_suffixes, rng) {
                let suffix_len = suffix.chars().count();
                if suffix_len < target {
                    out = out.chars().take(target - suffix_len).collect();
                    out.push_str(suffix);
                }
            }
        }
        out.chars().take(target).collect()
    }

    // Candidate n-grams must start with the last two characters (or one,
    // early on) of the string so far.
    fn ngram_extension(&self, so_far: &str, sm: &StringModel, rng: &mut StdRng) -> Option<char> {
        let tail: Vec<char> = so_far.chars().rev().take(2).collect::<Vec<_>>();
        let tail: String = tail.into_iter().rev().collect();
        if tail.is_empty() {
            return None;
        }

        let mut candidates: Vec<(char, u64)> = Vec::new();
        for (gram, count) in &sm.n_grams {
            let gram_chars: Vec<char> = gram.chars().collect();
            if tail.chars().count() == 2 && gram_chars.len() == 3 {
                if gram.starts_with(&tail) {
                    candidates.push((gram_chars[2], *count));
                }
            } else if gram_chars.len() == 2 {
                if let Some(last) = tail.chars().last() {
                    if gram_chars[0] == last {
                        candidates.push((gram_chars[1], *count));
                    }
                }
            }
        }
        if candidates.is_empty() {
            return None;
        }
        let total: u64 = candidates.iter().map(|(_, c)| c).sum();
        let mut pick = rng.gen_range(0..total);
        for (c, count) in candidates {
            if pick < count {
                return Some(c);
            }
            pick -= count;
        }
        None
    }
}

fn char_sum(s: &str) -> u64 {
    s.chars().map(|c| c as u64).sum()
}

fn weighted_key<'a>(map: &'a BTreeMap<String, u64>, rng: &mut StdRng) -> Option<&'a str> {
    let total: u64 = map.values().sum();
    if total == 0 {
        return None;
    }
    let mut pick = rng.gen_range(0..total);
    for (key, count) in map {
        if pick < *count {
            return Some(key);
        }
        pick -= count;
    }
    None
}

fn weighted_probability_key(map: &BTreeMap<String, f64>, rng: &mut StdRng) -> Option<char> {
    let total: f64 = map.values().sum();
    if total <= 0.0 {
        return None;
    }
    let mut pick = rng.gen_range(0.0..total);
    for (key, p) in map {
        if pick < *p {
            return key.chars().next();
        }
        pick -= p;
    }
    map.keys().last().and_then(|k| k.chars().next())
}
