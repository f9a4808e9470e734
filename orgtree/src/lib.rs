//! Org-mode outline parsing and document model.
//!
//! The crate keeps the core pure: parsing turns a sequence of raw lines into
//! a flat arena of nodes owned by one document, and every tree relation is
//! computed from heading levels on demand. File I/O stays at the edges.

pub mod core {
    use crate::date::{ClockEntry, RepeatedTask, Timestamp};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{collections::BTreeSet, fmt};

    /* ------------------------------- Errors ------------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum OrgError {
        #[error("invalid duration string {0:?}")]
        InvalidDuration(String),
        #[error("environment records source {env:?} but {given:?} was passed to parse")]
        SourceMismatch { env: String, given: String },
        #[error("file directive {key:?} appears {count} times; use file_property_list")]
        DuplicateDirective { key: String, count: usize },
        #[error("reading org source")]
        Io(#[from] std::io::Error),
    }

    /* -------------------------------- IDs -------------------------------- */

    /// Index of a node in its document's arena. Index 0 is always the root.
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    )]
    #[serde(transparent)]
    pub struct NodeId(pub usize);

    impl NodeId {
        pub const ROOT: NodeId = NodeId(0);
    }

    /* ---------------------------- Environment ---------------------------- */

    /// Per-document state shared by all nodes: the recognized TODO/DONE
    /// keyword vocabulary, the source identifier, and file-level `#+KEY:`
    /// directives collected before any heading is parsed.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct OrgEnv {
        todos: Vec<String>,
        dones: Vec<String>,
        defaults_replaced: bool,
        source: String,
        directives: IndexMap<String, Vec<String>>,
    }

    impl OrgEnv {
        /// Environment with the default `TODO`/`DONE` vocabulary.
        pub fn new(source: impl Into<String>) -> Self {
            Self::with_keywords(source, vec!["TODO".into()], vec!["DONE".into()])
        }

        /// Environment with a caller-supplied keyword vocabulary. The first
        /// in-document `#+TODO`-family directive still replaces it.
        pub fn with_keywords(
            source: impl Into<String>,
            todos: Vec<String>,
            dones: Vec<String>,
        ) -> Self {
            Self {
                todos,
                dones,
                defaults_replaced: false,
                source: source.into(),
                directives: IndexMap::new(),
            }
        }

        pub fn source(&self) -> &str {
            &self.source
        }

        pub fn todo_keys(&self) -> &[String] {
            &self.todos
        }

        pub fn done_keys(&self) -> &[String] {
            &self.dones
        }

        /// All recognized keywords, not-done first.
        pub fn all_todo_keys(&self) -> impl Iterator<Item = &str> {
            self.todos.iter().chain(self.dones.iter()).map(String::as_str)
        }

        /// Fold a `#+TODO`/`#+SEQ_TODO`/`#+TYP_TODO` directive into the
        /// vocabulary. The first directive replaces whatever was configured,
        /// later ones append.
        pub(crate) fn add_todo_keys(&mut self, todos: Vec<String>, dones: Vec<String>) {
            if !self.defaults_replaced {
                self.todos.clear();
                self.dones.clear();
                self.defaults_replaced = true;
            }
            self.todos.extend(todos);
            self.dones.extend(dones);
        }

        pub(crate) fn record_directive(&mut self, key: String, value: String) {
            self.directives.entry(key).or_default().push(value);
        }

        /// Every value a `#+KEY:` directive was given, in document order.
        /// Unknown keys yield an empty slice.
        pub fn file_property_list(&self, key: &str) -> &[String] {
            self.directives.get(key).map(Vec::as_slice).unwrap_or(&[])
        }

        /// Single-valued directive accessor. Errs when the key appeared more
        /// than once; the list accessor never does.
        pub fn file_property(&self, key: &str) -> Result<Option<&str>, OrgError> {
            let values = self.file_property_list(key);
            match values.len() {
                0 => Ok(None),
                1 => Ok(Some(values[0].as_str())),
                count => Err(OrgError::DuplicateDirective {
                    key: key.to_string(),
                    count,
                }),
            }
        }
    }

    /* ------------------------------- Values ------------------------------- */

    /// A property drawer value. `Effort` (and any other duration-valued key a
    /// caller opts into) is stored as minutes, everything else as trimmed text.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum PropertyValue {
        Text(String),
        Minutes(f64),
    }

    impl PropertyValue {
        pub fn as_str(&self) -> Option<&str> {
            match self {
                PropertyValue::Text(s) => Some(s),
                PropertyValue::Minutes(_) => None,
            }
        }

        pub fn as_minutes(&self) -> Option<f64> {
            match self {
                PropertyValue::Minutes(m) => Some(*m),
                PropertyValue::Text(_) => None,
            }
        }
    }

    /* -------------------------------- Node -------------------------------- */

    /// One outline entry: the root (level 0, index 0) or a heading with its
    /// chunk of raw lines and the metadata extracted from them.
    ///
    /// Nodes hold no tree pointers. Parents, children and siblings are
    /// recomputed from levels by scanning the owning document's node list.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct OrgNode {
        pub id: NodeId,
        /// 1-based line number of the first raw line of this chunk.
        pub start_line: usize,
        /// The verbatim chunk, heading line included.
        pub lines: Vec<String>,
        /// Raw lines minus everything the metadata extractors consumed.
        pub body_lines: Vec<String>,
        /// Count of leading stars; 0 for the root.
        pub level: usize,
        /// Heading text with stars, TODO keyword, priority and tags stripped.
        /// Empty for the root.
        pub heading: String,
        pub todo: Option<String>,
        pub priority: Option<char>,
        /// Own tags only; see [`crate::core::OrgDocument::effective_tags`]
        /// for the inherited set.
        pub tags: BTreeSet<String>,
        pub properties: IndexMap<String, PropertyValue>,
        pub scheduled: Option<Timestamp>,
        pub deadline: Option<Timestamp>,
        pub closed: Option<Timestamp>,
        pub clocks: Vec<ClockEntry>,
        /// Free timestamps found in the heading and the surviving body lines.
        pub timestamps: Vec<Timestamp>,
        pub repeated_tasks: Vec<RepeatedTask>,
    }

    impl OrgNode {
        pub fn is_root(&self) -> bool {
            self.level == 0
        }

        pub fn body(&self) -> String {
            self.body_lines.join("\n")
        }

        pub fn property(&self, key: &str) -> Option<&PropertyValue> {
            self.properties.get(key)
        }

        /// Timestamps without an end date (plain points).
        pub fn datelist(&self) -> Vec<&Timestamp> {
            self.timestamps.iter().filter(|ts| !ts.has_end()).collect()
        }

        /// Timestamps with an end date (ranges).
        pub fn rangelist(&self) -> Vec<&Timestamp> {
            self.timestamps.iter().filter(|ts| ts.has_end()).collect()
        }

        /// True when the node carries any scheduling-relevant date.
        pub fn has_date(&self) -> bool {
            self.scheduled.is_some() || self.deadline.is_some() || !self.timestamps.is_empty()
        }
    }

    impl fmt::Display for OrgNode {
        /// Renders the node back to exactly its raw source lines.
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.lines.join("\n"))
        }
    }

    /* ------------------------------ Document ------------------------------ */

    /// Owner of the parse result: the environment plus the flat, ordered node
    /// arena. All tree queries live here.
    ///
    /// Passing a `NodeId` that did not come from this document is a contract
    /// violation; queries will panic or return nodes of the wrong document.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct OrgDocument {
        env: OrgEnv,
        nodes: Vec<OrgNode>,
    }

    impl OrgDocument {
        pub(crate) fn new(env: OrgEnv, nodes: Vec<OrgNode>) -> Self {
            Self { env, nodes }
        }

        pub fn env(&self) -> &OrgEnv {
            &self.env
        }

        /// Node count, root included.
        pub fn len(&self) -> usize {
            self.nodes.len()
        }

        pub fn is_empty(&self) -> bool {
            self.nodes.is_empty()
        }

        pub fn root(&self) -> &OrgNode {
            &self.nodes[0]
        }

        pub fn node(&self, id: NodeId) -> &OrgNode {
            &self.nodes[id.0]
        }

        pub fn get(&self, id: NodeId) -> Option<&OrgNode> {
            self.nodes.get(id.0)
        }

        pub fn nodes(&self) -> &[OrgNode] {
            &self.nodes
        }

        fn nearest_shallower(&self, from: usize) -> Option<usize> {
            let level = self.nodes[from].level;
            (0..from).rev().find(|&i| self.nodes[i].level < level)
        }

        /// Parent: the nearest preceding node at a strictly smaller level.
        /// The root has none.
        pub fn parent(&self, id: NodeId) -> Option<NodeId> {
            let level = self.nodes[id.0].level;
            if level == 0 {
                return None;
            }
            self.parent_upto(id, level - 1)
        }

        /// Ancestor at level `max_level`, or the nearest ancestor below it
        /// when no ancestor sits at exactly that level. `max_level == 0`
        /// yields the root.
        pub fn parent_upto(&self, id: NodeId, max_level: usize) -> Option<NodeId> {
            let mut found = self.nearest_shallower(id.0)?;
            while self.nodes[found].level > max_level {
                found = self.nearest_shallower(found)?;
            }
            Some(NodeId(found))
        }

        /// Children in document order. A deeper node is accepted while its
        /// level does not exceed the level of the last accepted child, so a
        /// transiently deeper "cousin" still counts as a child once the
        /// deeper branch has closed.
        pub fn children(&self, id: NodeId) -> Vec<NodeId> {
            let own = self.nodes[id.0].level;
            let mut out = Vec::new();
            let mut last_child_level: Option<usize> = None;
            for index in id.0 + 1..self.nodes.len() {
                let level = self.nodes[index].level;
                if level <= own {
                    break;
                }
                match last_child_level {
                    None => {
                        out.push(NodeId(index));
                        last_child_level = Some(level);
                    }
                    Some(last) if level <= last => {
                        out.push(NodeId(index));
                        last_child_level = Some(level);
                    }
                    Some(_) => {}
                }
            }
            out
        }

        /// Nearest preceding node at the same level, None once a shallower
        /// node is crossed first.
        pub fn previous_same_level(&self, id: NodeId) -> Option<NodeId> {
            let own = self.nodes[id.0].level;
            for index in (0..id.0).rev() {
                let level = self.nodes[index].level;
                if level == own {
                    return Some(NodeId(index));
                }
                if level < own {
                    return None;
                }
            }
            None
        }

        /// Nearest following node at the same level, None once a shallower
        /// node is crossed first.
        pub fn next_same_level(&self, id: NodeId) -> Option<NodeId> {
            let own = self.nodes[id.0].level;
            for index in id.0 + 1..self.nodes.len() {
                let level = self.nodes[index].level;
                if level == own {
                    return Some(NodeId(index));
                }
                if level < own {
                    return None;
                }
            }
            None
        }

        /// Depth-first traversal of the subtree rooted at `id`, the node
        /// itself first. Subtrees are contiguous in the arena, so this is a
        /// plain index range.
        pub fn traverse(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
            let start = id.0;
            let level = self.nodes[start].level;
            let end = self.nodes[start + 1..]
                .iter()
                .position(|n| n.level <= level)
                .map(|offset| start + 1 + offset)
                .unwrap_or(self.nodes.len());
            (start..end).map(NodeId)
        }

        /// Own tags unioned with every ancestor's own tags (the root
        /// contributes its `#+FILETAGS`).
        pub fn effective_tags(&self, id: NodeId) -> BTreeSet<String> {
            let mut tags = self.nodes[id.0].tags.clone();
            let mut current = self.parent(id);
            while let Some(parent) = current {
                tags.extend(self.nodes[parent.0].tags.iter().cloned());
                current = self.parent(parent);
            }
            tags
        }
    }

}

pub mod date {
    //! The org date/time mini-language: active `<...>` and inactive `[...]`
    //! timestamps with optional time, same-day time range, repeater and
    //! warning cookies, two-sided `--` ranges, clock lines, repeated-task log
    //! lines and duration strings.

    use crate::core::OrgError;
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_till1, take_while},
        character::complete::{char, digit1, one_of, space0, space1},
        combinator::{all_consuming, map, map_res, opt, value},
        error::{VerboseError, VerboseErrorKind},
        sequence::{delimited, preceded, tuple},
    };
    use serde::{Deserialize, Serialize};
    use std::fmt;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn perror<'a>(i: &'a str, ctx: &'static str) -> nom::Err<VerboseError<&'a str>> {
        nom::Err::Error(VerboseError {
            errors: vec![(i, VerboseErrorKind::Context(ctx))],
        })
    }

    /* ------------------------------- Model ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum TimeUnit {
        Hour,
        Day,
        Week,
        Month,
        Year,
    }

    impl TimeUnit {
        pub fn symbol(self) -> char {
            match self {
                TimeUnit::Hour => 'h',
                TimeUnit::Day => 'd',
                TimeUnit::Week => 'w',
                TimeUnit::Month => 'm',
                TimeUnit::Year => 'y',
            }
        }
    }

    /// `+` reschedules from the last completion, `++` keeps the base date's
    /// weekday/monthday, `.+` reschedules from the completion day.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum RepeaterMark {
        Cumulate,
        CatchUp,
        Restart,
    }

    impl RepeaterMark {
        pub fn symbol(self) -> &'static str {
            match self {
                RepeaterMark::Cumulate => "+",
                RepeaterMark::CatchUp => "++",
                RepeaterMark::Restart => ".+",
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Repeater {
        pub mark: RepeaterMark,
        pub count: u32,
        pub unit: TimeUnit,
    }

    impl fmt::Display for Repeater {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}{}{}", self.mark.symbol(), self.count, self.unit.symbol())
        }
    }

    /// Advance-warning cookie such as `-3d`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Warning {
        pub count: u32,
        pub unit: TimeUnit,
    }

    impl fmt::Display for Warning {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "-{}{}", self.count, self.unit.symbol())
        }
    }

    /// A calendar date with an optional time of day.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DatePoint {
        pub date: NaiveDate,
        pub time: Option<NaiveTime>,
    }

    impl DatePoint {
        pub fn date(date: NaiveDate) -> Self {
            Self { date, time: None }
        }

        pub fn datetime(date: NaiveDate, time: NaiveTime) -> Self {
            Self {
                date,
                time: Some(time),
            }
        }

        pub fn has_time(&self) -> bool {
            self.time.is_some()
        }

        /// Midnight when no time of day was given.
        pub fn as_datetime(&self) -> NaiveDateTime {
            self.date.and_time(self.time.unwrap_or(NaiveTime::MIN))
        }

        fn write_into(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.date.format("%Y-%m-%d %a"))?;
            if let Some(time) = self.time {
                write!(f, " {}", time.format("%H:%M"))?;
            }
            Ok(())
        }
    }

    /// One org timestamp token, point or range.
    ///
    /// A range never exists without a start; the end is either the second
    /// half of a `--` pair or the tail of a same-day `HH:MM-HH:MM` form.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Timestamp {
        pub active: bool,
        pub start: DatePoint,
        pub end: Option<DatePoint>,
        pub repeater: Option<Repeater>,
        pub warning: Option<Warning>,
    }

    impl Timestamp {
        pub fn new(active: bool, start: DatePoint) -> Self {
            Self {
                active,
                start,
                end: None,
                repeater: None,
                warning: None,
            }
        }

        pub fn with_end(mut self, end: DatePoint) -> Self {
            self.end = Some(end);
            self
        }

        pub fn is_active(&self) -> bool {
            self.active
        }

        pub fn has_end(&self) -> bool {
            self.end.is_some()
        }

        pub fn has_time(&self) -> bool {
            self.start.has_time()
        }
    }

    /// Cookies do not participate in equality; two timestamps are the same
    /// moment regardless of how they repeat or warn.
    impl PartialEq for Timestamp {
        fn eq(&self, other: &Self) -> bool {
            self.active == other.active && self.start == other.start && self.end == other.end
        }
    }

    impl Eq for Timestamp {}

    impl fmt::Display for Timestamp {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let (open, close) = if self.active { ('<', '>') } else { ('[', ']') };
            // Same-day range with times on both sides renders compactly.
            let compact_end = self.end.filter(|end| {
                end.date == self.start.date && self.start.has_time() && end.has_time()
            });
            write!(f, "{open}")?;
            self.start.write_into(f)?;
            if let Some(end) = compact_end {
                if let Some(time) = end.time {
                    write!(f, "-{}", time.format("%H:%M"))?;
                }
            }
            if let Some(repeater) = self.repeater {
                write!(f, " {repeater}")?;
            }
            if let Some(warning) = self.warning {
                write!(f, " {warning}")?;
            }
            write!(f, "{close}")?;
            if let Some(end) = self.end {
                if compact_end.is_none() {
                    write!(f, "--{open}")?;
                    end.write_into(f)?;
                    write!(f, "{close}")?;
                }
            }
            Ok(())
        }
    }

    /// A `CLOCK:` log entry. `end` is absent for a clock still running (or a
    /// line whose closing timestamp was mangled).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ClockEntry {
        pub start: NaiveDateTime,
        pub end: Option<NaiveDateTime>,
        /// Minutes stated after `=>` in the source. Informational only; the
        /// real duration is always recomputed from the endpoints.
        pub stated_minutes: Option<i64>,
    }

    impl ClockEntry {
        pub fn duration_minutes(&self) -> Option<i64> {
            self.end.map(|end| (end - self.start).num_minutes())
        }

        pub fn is_running(&self) -> bool {
            self.end.is_none()
        }

        /// Whether the stated `=>` duration matches the recomputed one. A
        /// mismatch is advisory, never a parse failure.
        pub fn is_duration_consistent(&self) -> bool {
            match self.stated_minutes {
                None => true,
                Some(minutes) => self.duration_minutes() == Some(minutes),
            }
        }
    }

    /// One `- State "X" from "Y" [timestamp]` log line of a repeating task.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RepeatedTask {
        /// Keyword the entry moved to on completion (usually a DONE state).
        pub to: String,
        /// Keyword the entry held before completion.
        pub from: String,
        pub at: Timestamp,
    }

    /* ---------------------------- Point grammar ---------------------------- */

    fn digits_m_n<'a>(min: usize, max: usize) -> impl Fn(&'a str) -> PResult<'a, &'a str> {
        move |i: &'a str| {
            let (rest, out) = take_while(|c: char| c.is_ascii_digit())(i)?;
            if out.len() < min || out.len() > max {
                Err(perror(i, "digits"))
            } else {
                Ok((rest, out))
            }
        }
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(digits_m_n(4, 4), |s: &str| s.parse::<i32>()),
                char('-'),
                map_res(digits_m_n(2, 2), |s: &str| s.parse::<u32>()),
                char('-'),
                map_res(digits_m_n(2, 2), |s: &str| s.parse::<u32>()),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_res(
            tuple((
                map_res(digits_m_n(1, 2), |s: &str| s.parse::<u32>()),
                char(':'),
                map_res(digits_m_n(2, 2), |s: &str| s.parse::<u32>()),
            )),
            |(h, _, m)| NaiveTime::from_hms_opt(h, m, 0).ok_or("invalid time"),
        )(i)
    }

    fn time_range_token(i: &str) -> PResult<'_, (NaiveTime, Option<NaiveTime>)> {
        let (i, start) = parse_time(i)?;
        let (i, end) = opt(preceded(char('-'), parse_time))(i)?;
        Ok((i, (start, end)))
    }

    fn time_unit(i: &str) -> PResult<'_, TimeUnit> {
        map(one_of("hdwmy"), |c| match c {
            'h' => TimeUnit::Hour,
            'd' => TimeUnit::Day,
            'w' => TimeUnit::Week,
            'm' => TimeUnit::Month,
            _ => TimeUnit::Year,
        })(i)
    }

    fn repeater_token(i: &str) -> PResult<'_, Repeater> {
        let (i, mark) = alt((
            value(RepeaterMark::Restart, tag(".+")),
            value(RepeaterMark::CatchUp, tag("++")),
            value(RepeaterMark::Cumulate, tag("+")),
        ))(i)?;
        let (i, count) = map_res(digit1, |s: &str| s.parse::<u32>())(i)?;
        let (i, unit) = time_unit(i)?;
        Ok((i, Repeater { mark, count, unit }))
    }

    fn warning_token(i: &str) -> PResult<'_, Warning> {
        let (i, _) = char('-')(i)?;
        let (i, count) = map_res(digit1, |s: &str| s.parse::<u32>())(i)?;
        let (i, unit) = time_unit(i)?;
        Ok((i, Warning { count, unit }))
    }

    /// One bracketed timestamp at the start of the input. The day name is
    /// recognized and discarded, never validated against the date; unknown
    /// filler tokens inside the brackets are skipped the same way.
    pub fn parse_timestamp(i: &str) -> PResult<'_, Timestamp> {
        let active = i.starts_with('<');
        let close = if active { '>' } else { ']' };
        let (i, _) = if active { char('<')(i)? } else { char('[')(i)? };
        let (i, date) = parse_date(i)?;

        let mut time = None;
        let mut end_time = None;
        let mut repeater = None;
        let mut warning = None;
        let mut rest = i;
        loop {
            let (r, _) = space0::<_, VerboseError<&str>>(rest)?;
            if r.is_empty() {
                return Err(perror(r, "timestamp-close"));
            }
            if r.starts_with(close) {
                rest = r;
                break;
            }
            let (r, token) =
                take_till1::<_, _, VerboseError<&str>>(|c| c == ' ' || c == close)(r)?;
            if let Ok((_, (t, et))) = all_consuming(time_range_token)(token) {
                time = Some(t);
                end_time = et;
            } else if let Ok((_, rep)) = all_consuming(repeater_token)(token) {
                repeater = Some(rep);
            } else if let Ok((_, warn)) = all_consuming(warning_token)(token) {
                warning = Some(warn);
            }
            rest = r;
        }
        let (i, _) = char(close)(rest)?;

        Ok((
            i,
            Timestamp {
                active,
                start: DatePoint { date, time },
                end: end_time.map(|t| DatePoint {
                    date,
                    time: Some(t),
                }),
                repeater,
                warning,
            },
        ))
    }

    /* ----------------------------- Scanning ----------------------------- */

    /// All timestamps in `text`, left to right. A timestamp immediately
    /// followed by `--` and a second timestamp of the same bracket type is
    /// merged into one range. Iterative on purpose; no recursion on the
    /// remainder.
    pub fn scan_timestamps(text: &str) -> Vec<Timestamp> {
        let mut out = Vec::new();
        let mut rest = text;
        while let Some(pos) = rest.find(['<', '[']) {
            let candidate = &rest[pos..];
            match parse_timestamp(candidate) {
                Ok((after, mut first)) => {
                    let mut consumed_to = after;
                    if let Some(second_text) = after.strip_prefix("--") {
                        let same_bracket =
                            second_text.starts_with(if first.active { '<' } else { '[' });
                        if same_bracket {
                            if let Ok((after_second, second)) = parse_timestamp(second_text) {
                                first.end = Some(second.start);
                                consumed_to = after_second;
                            }
                        }
                    }
                    out.push(first);
                    rest = consumed_to;
                }
                Err(_) => rest = &candidate[1..],
            }
        }
        out
    }

    /* ----------------------- Context-prefixed lines ----------------------- */

    fn keyword_timestamp(line: &str, keyword: &str, want_active: bool) -> Option<Timestamp> {
        let index = line.find(keyword)?;
        let rest = &line[index + keyword.len()..];
        // at least one whitespace between the colon and the timestamp
        if !rest.starts_with(|c: char| c.is_whitespace()) {
            return None;
        }
        let (_, ts) = parse_timestamp(rest.trim_start()).ok()?;
        if ts.active != want_active {
            return None;
        }
        Some(ts)
    }

    /// SCHEDULED/DEADLINE/CLOSED fields of one planning line. SCHEDULED and
    /// DEADLINE take active timestamps, CLOSED an inactive one; a bracket of
    /// the wrong kind does not match. Callers must not feed comment lines.
    pub fn parse_sdc_line(
        line: &str,
    ) -> (Option<Timestamp>, Option<Timestamp>, Option<Timestamp>) {
        (
            keyword_timestamp(line, "SCHEDULED:", true),
            keyword_timestamp(line, "DEADLINE:", true),
            keyword_timestamp(line, "CLOSED:", false),
        )
    }

    fn leading_digits(s: &str) -> Option<(i64, &str)> {
        let end = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        if end == 0 {
            return None;
        }
        Some((s[..end].parse().ok()?, &s[end..]))
    }

    fn parse_stated_minutes(text: &str) -> Option<i64> {
        let text = text.trim_start();
        let (hours, rest) = leading_digits(text)?;
        let rest = rest.strip_prefix(':')?;
        let (minutes, _) = leading_digits(rest)?;
        Some(hours * 60 + minutes)
    }

    /// A `CLOCK:` line. The start must be an inactive timestamp with a time
    /// of day. A missing or mangled closing timestamp yields an open entry;
    /// the line is consumed either way.
    pub fn parse_clock_line(line: &str) -> Option<ClockEntry> {
        let rest = line.trim_start().strip_prefix("CLOCK:")?;
        if !rest.starts_with(|c: char| c.is_whitespace()) {
            return None;
        }
        let rest = rest.trim_start();
        let (rest, start_ts) = parse_timestamp(rest).ok()?;
        if start_ts.active || !start_ts.start.has_time() {
            return None;
        }
        let start = start_ts.start.as_datetime();

        let mut end = None;
        let mut after = rest;
        if let Some(second_text) = rest.strip_prefix("--") {
            match parse_timestamp(second_text) {
                Ok((rest2, end_ts)) if !end_ts.active && end_ts.start.has_time() => {
                    end = Some(end_ts.start.as_datetime());
                    after = rest2;
                }
                // half-closed bracket: the clock stays open
                _ => after = "",
            }
        }

        let stated_minutes = after
            .trim_start()
            .strip_prefix("=>")
            .and_then(parse_stated_minutes);

        Some(ClockEntry {
            start,
            end,
            stated_minutes,
        })
    }

    fn quoted(i: &str) -> PResult<'_, &str> {
        delimited(char('"'), take_till1(|c| c == '"'), char('"'))(i)
    }

    /// A repeated-task log line: `- State "DONE" from "TODO" [timestamp]`,
    /// indented as org-mode writes it.
    pub fn parse_repeated_task_line(line: &str) -> Option<RepeatedTask> {
        let prefix: PResult<'_, (&str, &str)> = map(
            tuple((
                space1,
                char('-'),
                space1,
                tag("State"),
                space1,
                quoted,
                space1,
                tag("from"),
                space1,
                quoted,
                space1,
            )),
            |(_, _, _, _, _, to, _, _, _, from, _)| (to, from),
        )(line);
        let (rest, (to, from)) = prefix.ok()?;
        if !rest.starts_with('[') {
            return None;
        }
        let (_, at) = parse_timestamp(rest).ok()?;
        Some(RepeatedTask {
            to: to.to_string(),
            from: from.to_string(),
            at,
        })
    }

    /* ------------------------------ Durations ------------------------------ */

    fn hms_minutes(token: &str) -> Option<f64> {
        let parts: Vec<&str> = token.split(':').collect();
        if parts.len() != 2 && parts.len() != 3 {
            return None;
        }
        let mut numbers = Vec::with_capacity(parts.len());
        for part in parts {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            numbers.push(part.parse::<u64>().ok()?);
        }
        let mut minutes = numbers[0] as f64 * 60.0 + numbers[1] as f64;
        if let Some(seconds) = numbers.get(2) {
            minutes += *seconds as f64 / 60.0;
        }
        Some(minutes)
    }

    fn unit_minutes(token: &str) -> Option<f64> {
        let split = token.find(|c: char| !c.is_ascii_digit() && c != '.')?;
        let (number, unit) = token.split_at(split);
        let number: f64 = number.parse().ok()?;
        let scale = match unit {
            "min" => 1.0,
            "h" => 60.0,
            "d" => 1440.0,
            "w" => 10080.0,
            "m" => 43200.0,
            "y" => 525960.0,
            _ => return None,
        };
        Some(number * scale)
    }

    /// Duration text to minutes: `H:MM`, `H:MM:SS`, a bare number, a run of
    /// `<number><unit>` tokens (min/h/d/w/m/y), or unit tokens closed by one
    /// `H:MM[:SS]` tail. The empty string is zero minutes; anything else that
    /// fits no form is an error.
    pub fn parse_duration(text: &str) -> Result<f64, OrgError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(0.0);
        }
        if let Some(minutes) = hms_minutes(trimmed) {
            return Ok(minutes);
        }
        if let Ok(number) = trimmed.parse::<f64>() {
            return Ok(number);
        }

        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        let mut total = 0.0;
        for (index, token) in tokens.iter().enumerate() {
            if let Some(minutes) = unit_minutes(token) {
                total += minutes;
                continue;
            }
            if index + 1 == tokens.len() {
                if let Some(minutes) = hms_minutes(token) {
                    total += minutes;
                    continue;
                }
            }
            return Err(OrgError::InvalidDuration(text.to_string()));
        }
        Ok(total)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
        }

        fn hm(h: u32, m: u32) -> NaiveTime {
            NaiveTime::from_hms_opt(h, m, 0).expect("valid time")
        }

        #[test]
        fn point_timestamp_date_only() {
            let (rest, ts) = parse_timestamp("<2010-06-21 Mon> tail").expect("parse");
            assert_eq!(rest, " tail");
            assert!(ts.active);
            assert_eq!(ts.start, DatePoint::date(ymd(2010, 6, 21)));
            assert!(!ts.has_end());
            assert!(!ts.has_time());
        }

        #[test]
        fn point_timestamp_with_cookies() {
            let (_, ts) = parse_timestamp("<2005-10-01 Sat 12:30 +7m -3d>").expect("parse");
            assert_eq!(ts.start, DatePoint::datetime(ymd(2005, 10, 1), hm(12, 30)));
            assert_eq!(
                ts.repeater,
                Some(Repeater {
                    mark: RepeaterMark::Cumulate,
                    count: 7,
                    unit: TimeUnit::Month,
                })
            );
            assert_eq!(
                ts.warning,
                Some(Warning {
                    count: 3,
                    unit: TimeUnit::Day,
                })
            );
        }

        #[test]
        fn repeater_marks() {
            for (text, mark) in [
                ("<2024-01-01 Mon +1w>", RepeaterMark::Cumulate),
                ("<2024-01-01 Mon ++2d>", RepeaterMark::CatchUp),
                ("<2024-01-01 Mon .+3h>", RepeaterMark::Restart),
            ] {
                let (_, ts) = parse_timestamp(text).expect("parse");
                assert_eq!(ts.repeater.expect("repeater").mark, mark, "{text}");
            }
        }

        #[test]
        fn intraday_time_range() {
            let (_, ts) = parse_timestamp("<2019-08-10 Sat 16:30-17:30>").expect("parse");
            assert_eq!(ts.start, DatePoint::datetime(ymd(2019, 8, 10), hm(16, 30)));
            assert_eq!(ts.end, Some(DatePoint::datetime(ymd(2019, 8, 10), hm(17, 30))));
        }

        #[test]
        fn inactive_timestamp() {
            let (_, ts) = parse_timestamp("[2012-02-26 Sun 21:15]").expect("parse");
            assert!(!ts.active);
            assert_eq!(ts.start, DatePoint::datetime(ymd(2012, 2, 26), hm(21, 15)));
        }

        #[test]
        fn day_name_is_discarded_not_validated() {
            // 2010-06-21 was a Monday; the wrong day name still parses.
            let (_, ts) = parse_timestamp("<2010-06-21 Fri>").expect("parse");
            assert_eq!(ts.start, DatePoint::date(ymd(2010, 6, 21)));
        }

        #[test]
        fn scan_finds_timestamps_in_order() {
            let found = scan_timestamps("... <2012-02-10 Fri> and <2012-02-12 Sun>");
            assert_eq!(
                found,
                vec![
                    Timestamp::new(true, DatePoint::date(ymd(2012, 2, 10))),
                    Timestamp::new(true, DatePoint::date(ymd(2012, 2, 12))),
                ]
            );
        }

        #[test]
        fn scan_merges_same_bracket_ranges() {
            let found = scan_timestamps("<2012-02-10 Fri>--<2012-02-12 Sun>");
            assert_eq!(
                found,
                vec![
                    Timestamp::new(true, DatePoint::date(ymd(2012, 2, 10)))
                        .with_end(DatePoint::date(ymd(2012, 2, 12)))
                ]
            );
        }

        #[test]
        fn scan_keeps_mixed_bracket_pairs_separate() {
            let found = scan_timestamps("<2012-02-10 Fri>--[2012-02-12 Sun]");
            assert_eq!(found.len(), 2);
            assert!(found[0].active);
            assert!(!found[1].active);
            assert!(!found[0].has_end());
        }

        #[test]
        fn scan_ignores_non_timestamp_text() {
            assert!(scan_timestamps("this is not a timestamp").is_empty());
            assert!(scan_timestamps("almost <2012-13-40 Xxx> one").is_empty());
        }

        #[test]
        fn display_round_trips() {
            let texts = [
                "<2012-02-26 Sun>",
                "[2012-02-26 Sun 21:15]",
                "<2005-10-01 Sat 12:30 +7m -3d>",
                "<2019-08-10 Sat 16:30-17:30>",
                "<2012-02-10 Fri>--<2012-02-12 Sun>",
                "[2010-08-09 Mon 00:30]--[2010-08-10 Tue 13:20]",
            ];
            for text in texts {
                let parsed = scan_timestamps(text);
                assert_eq!(parsed.len(), 1, "{text}");
                let rendered = parsed[0].to_string();
                let reparsed = scan_timestamps(&rendered);
                assert_eq!(reparsed.len(), 1, "{rendered}");
                assert_eq!(reparsed[0], parsed[0], "{text} vs {rendered}");
            }
        }

        #[test]
        fn sdc_line_brackets_are_enforced() {
            let (s, d, c) = parse_sdc_line(
                "  CLOSED: [2010-08-08 Sun 18:00] SCHEDULED: <2010-08-06 Fri> DEADLINE: <2010-08-10 Tue>",
            );
            assert_eq!(s, Some(Timestamp::new(true, DatePoint::date(ymd(2010, 8, 6)))));
            assert_eq!(d, Some(Timestamp::new(true, DatePoint::date(ymd(2010, 8, 10)))));
            assert_eq!(
                c,
                Some(Timestamp::new(
                    false,
                    DatePoint::datetime(ymd(2010, 8, 8), hm(18, 0))
                ))
            );

            // wrong bracket type does not count
            let (s, _, _) = parse_sdc_line("SCHEDULED: [2010-08-06 Fri]");
            assert_eq!(s, None);
        }

        #[test]
        fn clock_line_consistency() {
            let entry =
                parse_clock_line("CLOCK: [2010-08-08 Sun 17:00]--[2010-08-08 Sun 17:30] => 0:30")
                    .expect("clock");
            assert_eq!(entry.duration_minutes(), Some(30));
            assert_eq!(entry.stated_minutes, Some(30));
            assert!(entry.is_duration_consistent());

            let entry =
                parse_clock_line("CLOCK: [2010-08-08 Sun 17:00]--[2010-08-08 Sun 17:30] => 0:15")
                    .expect("clock");
            assert_eq!(entry.duration_minutes(), Some(30));
            assert!(!entry.is_duration_consistent());
        }

        #[test]
        fn open_clock_lines() {
            let entry = parse_clock_line("CLOCK: [2010-08-08 Sun 16:00]").expect("clock");
            assert!(entry.is_running());
            assert!(entry.is_duration_consistent());

            // mangled closing bracket still consumes as an open clock
            let entry = parse_clock_line("CLOCK: [2010-08-08 Sun 16:00]--[2010-08-08 Sun")
                .expect("clock");
            assert!(entry.is_running());
        }

        #[test]
        fn clock_requires_inactive_start_with_time() {
            assert!(parse_clock_line("CLOCK: <2010-08-08 Sun 17:00>").is_none());
            assert!(parse_clock_line("CLOCK: [2010-08-08 Sun]").is_none());
            assert!(parse_clock_line("not a clock line").is_none());
        }

        #[test]
        fn repeated_task_line() {
            let entry =
                parse_repeated_task_line("   - State \"DONE\"  from \"TODO\"  [2005-09-01 Thu 16:10]")
                    .expect("repeated task");
            assert_eq!(entry.to, "DONE");
            assert_eq!(entry.from, "TODO");
            assert_eq!(
                entry.at,
                Timestamp::new(false, DatePoint::datetime(ymd(2005, 9, 1), hm(16, 10)))
            );

            // the dash must be indented
            assert!(
                parse_repeated_task_line("- State \"DONE\" from \"TODO\" [2005-09-01 Thu 16:10]")
                    .is_none()
            );
        }

        #[test]
        fn durations_to_minutes() {
            assert_eq!(parse_duration("1:10").expect("h:mm"), 70.0);
            assert_eq!(parse_duration("1:10:30").expect("h:mm:ss"), 70.5);
            assert_eq!(parse_duration("90").expect("number"), 90.0);
            assert_eq!(parse_duration("2.5").expect("decimal"), 2.5);
            assert_eq!(
                parse_duration("1y 3d 3h 4min").expect("units"),
                525960.0 + 3.0 * 1440.0 + 180.0 + 4.0
            );
            assert_eq!(parse_duration("1h 10:30").expect("mixed"), 690.0);
            assert_eq!(parse_duration("").expect("empty"), 0.0);
            assert_eq!(parse_duration("  ").expect("blank"), 0.0);
        }

        #[test]
        fn invalid_durations_fail() {
            for text in ["junk", "3x", "1h junk", "10:30 1h", "min"] {
                assert!(
                    matches!(parse_duration(text), Err(OrgError::InvalidDuration(_))),
                    "{text:?} should be rejected"
                );
            }
        }

        #[test]
        fn timestamp_equality_ignores_cookies() {
            let (_, with_cookie) = parse_timestamp("<2005-10-01 Sat +1m>").expect("parse");
            let plain = Timestamp::new(true, DatePoint::date(ymd(2005, 10, 1)));
            assert_eq!(with_cookie, plain);
        }
    }
}

pub mod parser {
    //! Line chunking, structured-field grammars and the two-phase parse:
    //! directives first over every chunk, then per-node field extraction.

    use crate::core::{NodeId, OrgDocument, OrgEnv, OrgError, OrgNode, PropertyValue};
    use crate::date::{
        Timestamp, parse_clock_line, parse_duration, parse_repeated_task_line, parse_sdc_line,
        scan_timestamps,
    };
    use indexmap::IndexMap;
    use nom::{
        IResult,
        bytes::complete::take_till1,
        character::complete::{char, space0},
        combinator::{map, rest},
        error::VerboseError,
        sequence::tuple,
    };
    use std::{collections::BTreeSet, fs, path::Path};

    /* --------------------------- Entry points --------------------------- */

    /// Parse newline-stripped lines into a document. `source` is an opaque
    /// identifier recorded on the environment for diagnostics.
    pub fn parse<I, S>(source: &str, lines: I) -> Result<OrgDocument, OrgError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        parse_with_env(OrgEnv::new(source), source, lines)
    }

    /// Like [`parse`] but with a caller-supplied environment, e.g. to
    /// predefine a custom TODO vocabulary. The environment must have been
    /// created for the same source identifier.
    pub fn parse_with_env<I, S>(
        mut env: OrgEnv,
        source: &str,
        lines: I,
    ) -> Result<OrgDocument, OrgError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if env.source() != source {
            return Err(OrgError::SourceMismatch {
                env: env.source().to_string(),
                given: source.to_string(),
            });
        }

        let collected: Vec<String> = lines.into_iter().map(Into::into).collect();
        let chunks = lines_to_chunks(collected);

        // Directive pre-pass: the TODO vocabulary must be complete before any
        // heading is parsed, wherever the directive sits in the file.
        for chunk in &chunks {
            for line in chunk {
                if let Some((key, value)) = parse_directive(line) {
                    if matches!(key.as_str(), "TODO" | "SEQ_TODO" | "TYP_TODO") {
                        let (todos, dones) = parse_todo_directive(&value);
                        env.add_todo_keys(todos, dones);
                    }
                    env.record_directive(key, value);
                }
            }
        }

        let mut nodes = Vec::with_capacity(chunks.len());
        let mut next_line = 1usize;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let start_line = next_line;
            next_line += chunk.len();
            let node = if index == 0 {
                build_root(&env, start_line, chunk)?
            } else {
                build_heading(&env, NodeId(index), start_line, chunk)?
            };
            nodes.push(node);
        }
        Ok(OrgDocument::new(env, nodes))
    }

    /// Parse a document from a string.
    pub fn loads(text: &str) -> Result<OrgDocument, OrgError> {
        parse("<string>", text.lines())
    }

    /// Parse a document from a file; the path becomes the source identifier.
    pub fn load(path: impl AsRef<Path>) -> Result<OrgDocument, OrgError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        parse(&path.display().to_string(), text.lines())
    }

    /* ----------------------------- Chunking ----------------------------- */

    /// Heading when the line starts with one-or-more `*` then a space. A
    /// stars-only line is body text, not a heading.
    pub fn is_heading_line(line: &str) -> bool {
        let stars = line.chars().take_while(|&c| c == '*').count();
        stars >= 1 && line[stars..].starts_with(' ')
    }

    /// One chunk per heading line, preceded by the (possibly empty) root
    /// chunk of lines before the first heading.
    fn lines_to_chunks(lines: Vec<String>) -> Vec<Vec<String>> {
        let mut chunks = vec![Vec::new()];
        for line in lines {
            if is_heading_line(&line) {
                chunks.push(Vec::new());
            }
            chunks.last_mut().unwrap().push(line);
        }
        chunks
    }

    /* ------------------------- Field-level grammar ------------------------- */

    fn is_tag_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_' || c == '@'
    }

    /// Split a trailing `:TAG1:TAG2:` group off the heading text. Tags are
    /// limited to the tag charset; anything else leaves the text untouched,
    /// colons included.
    pub fn parse_heading_tags(text: &str) -> (String, BTreeSet<String>) {
        let trimmed = text.trim_end();
        if trimmed.ends_with(':') {
            // maximal trailing run of tag characters and colons
            let run_start = match trimmed
                .char_indices()
                .rev()
                .find(|(_, c)| !is_tag_char(*c) && *c != ':')
            {
                Some((index, c)) => index + c.len_utf8(),
                None => 0,
            };
            let run = &trimmed[run_start..];
            if let Some(colon) = run.find(':') {
                let segment = &run[colon..];
                if segment.len() >= 2 {
                    let inner = &segment[1..segment.len() - 1];
                    let tags: BTreeSet<String> = inner
                        .split(':')
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect();
                    if !tags.is_empty() {
                        let head = trimmed[..run_start + colon].trim_end();
                        return (head.to_string(), tags);
                    }
                }
            }
        }
        (text.trim().to_string(), BTreeSet::new())
    }

    /// Strip a recognized TODO keyword: the text must equal the keyword or
    /// continue with a space after it. First match in vocabulary order wins.
    pub fn parse_heading_todo(text: &str, env: &OrgEnv) -> (String, Option<String>) {
        for key in env.all_todo_keys() {
            if text == key {
                return (String::new(), Some(key.to_string()));
            }
            if let Some(after) = text.strip_prefix(key) {
                if let Some(rest) = after.strip_prefix(' ') {
                    return (rest.to_string(), Some(key.to_string()));
                }
            }
        }
        (text.to_string(), None)
    }

    /// Strip a leading `[#X]` priority cookie (one uppercase letter or
    /// digit), plus at most one following space.
    pub fn parse_heading_priority(text: &str) -> (String, Option<char>) {
        let trimmed = text.trim_start();
        if let Some(after) = trimmed.strip_prefix("[#") {
            let mut chars = after.chars();
            if let (Some(cookie), Some(']')) = (chars.next(), chars.next()) {
                if cookie.is_ascii_uppercase() || cookie.is_ascii_digit() {
                    let remainder = chars.as_str();
                    let remainder = remainder.strip_prefix(' ').unwrap_or(remainder);
                    return (remainder.to_string(), Some(cookie));
                }
            }
        }
        (text.to_string(), None)
    }

    /// A `:KEY: value` property line.
    pub fn parse_property(line: &str) -> Option<(String, String)> {
        let parsed: IResult<&str, (&str, &str), VerboseError<&str>> = map(
            tuple((
                space0,
                char(':'),
                take_till1(|c| c == ':'),
                char(':'),
                space0,
                rest,
            )),
            |(_, _, key, _, _, value)| (key, value),
        )(line);
        match parsed {
            Ok((_, (key, value))) => Some((key.to_string(), value.trim_end().to_string())),
            Err(_) => None,
        }
    }

    /// A `#+KEY: value` file directive. The key is everything up to the
    /// first colon; no leading whitespace is allowed.
    pub fn parse_directive(line: &str) -> Option<(String, String)> {
        let rest = line.strip_prefix("#+")?;
        let (key, value) = rest.split_once(':')?;
        Some((key.to_string(), value.trim().to_string()))
    }

    /// The value of a TODO-keyword directive: `|` splits not-done from done
    /// keywords, `(f)` fast-selection suffixes are dropped.
    pub fn parse_todo_directive(value: &str) -> (Vec<String>, Vec<String>) {
        let (todos, dones) = match value.split_once('|') {
            Some((todos, dones)) => (todos, dones),
            None => (value, ""),
        };
        (split_keywords(todos), split_keywords(dones))
    }

    fn split_keywords(text: &str) -> Vec<String> {
        text.split_whitespace().map(strip_fast_key).collect()
    }

    fn strip_fast_key(token: &str) -> String {
        match token.find('(') {
            Some(index) if token.ends_with(')') => token[..index].to_string(),
            _ => token.to_string(),
        }
    }

    fn is_comment_line(line: &str) -> bool {
        line.trim_start().starts_with('#')
    }

    /* ------------------------- Per-node extraction ------------------------- */

    type SdcFields = (Option<Timestamp>, Option<Timestamp>, Option<Timestamp>);

    /// Planning fields are taken from the first non-comment line only; the
    /// line is consumed when any field matched. Comment lines pass through,
    /// which keeps a commented-out `# SCHEDULED:` inert.
    fn extract_sdc(lines: Vec<String>) -> (SdcFields, Vec<String>) {
        let mut scheduled = None;
        let mut deadline = None;
        let mut closed = None;
        let mut out = Vec::with_capacity(lines.len());
        let mut tried = false;
        for line in lines {
            if tried || is_comment_line(&line) {
                out.push(line);
                continue;
            }
            tried = true;
            let (s, d, c) = parse_sdc_line(&line);
            if s.is_none() && d.is_none() && c.is_none() {
                out.push(line);
            } else {
                scheduled = s;
                deadline = d;
                closed = c;
            }
        }
        ((scheduled, deadline, closed), out)
    }

    fn extract_clocks(lines: Vec<String>) -> (Vec<crate::date::ClockEntry>, Vec<String>) {
        let mut clocks = Vec::new();
        let mut out = Vec::with_capacity(lines.len());
        for line in lines {
            match parse_clock_line(&line) {
                Some(entry) => clocks.push(entry),
                None => out.push(line),
            }
        }
        (clocks, out)
    }

    /// Consume the first `:PROPERTIES:` ... `:END:` block. Every inner line
    /// is tried against the property grammar and consumed either way;
    /// `Effort` values go through the duration parser.
    fn extract_properties(
        lines: Vec<String>,
    ) -> Result<(IndexMap<String, PropertyValue>, Vec<String>), OrgError> {
        #[derive(Clone, Copy)]
        enum State {
            Outside,
            Inside,
            Done,
        }
        let mut properties = IndexMap::new();
        let mut out = Vec::with_capacity(lines.len());
        let mut state = State::Outside;
        for line in lines {
            match state {
                State::Outside if line.contains(":PROPERTIES:") => state = State::Inside,
                State::Outside => out.push(line),
                State::Inside if line.contains(":END:") => state = State::Done,
                State::Inside => {
                    if let Some((key, value)) = parse_property(&line) {
                        let value = if key == "Effort" {
                            PropertyValue::Minutes(parse_duration(&value)?)
                        } else {
                            PropertyValue::Text(value)
                        };
                        properties.insert(key, value);
                    }
                }
                State::Done => out.push(line),
            }
        }
        Ok((properties, out))
    }

    fn extract_repeated_tasks(
        lines: Vec<String>,
    ) -> (Vec<crate::date::RepeatedTask>, Vec<String>) {
        let mut tasks = Vec::new();
        let mut out = Vec::with_capacity(lines.len());
        for line in lines {
            match parse_repeated_task_line(&line) {
                Some(task) => tasks.push(task),
                None => out.push(line),
            }
        }
        (tasks, out)
    }

    fn build_heading(
        env: &OrgEnv,
        id: NodeId,
        start_line: usize,
        lines: Vec<String>,
    ) -> Result<OrgNode, OrgError> {
        let raw = &lines[0];
        let level = raw.chars().take_while(|&c| c == '*').count();
        let text = raw[level..].trim();

        let (text, tags) = parse_heading_tags(text);
        let (text, todo) = parse_heading_todo(&text, env);
        let (heading, priority) = parse_heading_priority(&text);

        let mut timestamps = scan_timestamps(&heading);

        let body = lines[1..].to_vec();
        let ((scheduled, deadline, closed), body) = extract_sdc(body);
        let (clocks, body) = extract_clocks(body);
        let (properties, body) = extract_properties(body)?;
        let (repeated_tasks, body) = extract_repeated_tasks(body);
        for line in &body {
            timestamps.extend(scan_timestamps(line));
        }

        Ok(OrgNode {
            id,
            start_line,
            level,
            heading,
            todo,
            priority,
            tags,
            properties,
            scheduled,
            deadline,
            closed,
            clocks,
            timestamps,
            repeated_tasks,
            body_lines: body,
            lines,
        })
    }

    /// The root has no heading and no planning fields; it carries the
    /// `#+FILETAGS` tags plus properties and free timestamps of the lines
    /// before the first heading.
    fn build_root(env: &OrgEnv, start_line: usize, lines: Vec<String>) -> Result<OrgNode, OrgError> {
        let mut tags = BTreeSet::new();
        for value in env.file_property_list("FILETAGS") {
            for tag in value.split(':').filter(|t| !t.is_empty()) {
                tags.insert(tag.to_string());
            }
        }

        let body = lines.clone();
        let (properties, body) = extract_properties(body)?;
        let mut timestamps = Vec::new();
        for line in &body {
            timestamps.extend(scan_timestamps(line));
        }

        Ok(OrgNode {
            id: NodeId::ROOT,
            start_line,
            level: 0,
            heading: String::new(),
            todo: None,
            priority: None,
            tags,
            properties,
            scheduled: None,
            deadline: None,
            closed: None,
            clocks: Vec::new(),
            timestamps,
            repeated_tasks: Vec::new(),
            body_lines: body,
            lines,
        })
    }

}

pub mod format {
    //! Textual rendering. Documents and nodes render back to their verbatim
    //! source lines; only timestamps canonicalize (via their `Display`).

    use crate::core::{NodeId, OrgDocument};

    /// The whole document, exactly as parsed, one line per raw line.
    pub fn render_document(doc: &OrgDocument) -> String {
        let mut out = String::new();
        for node in doc.nodes() {
            for line in &node.lines {
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }

    /// A compact outline listing: stars, TODO keyword, heading, own tags.
    pub fn render_outline(doc: &OrgDocument) -> String {
        let mut out = String::new();
        for id in doc.traverse(NodeId::ROOT).skip(1) {
            let node = doc.node(id);
            out.push_str(&"*".repeat(node.level));
            out.push(' ');
            if let Some(todo) = &node.todo {
                out.push_str(todo);
                out.push(' ');
            }
            out.push_str(&node.heading);
            if !node.tags.is_empty() {
                out.push_str(" :");
                for tag in &node.tags {
                    out.push_str(tag);
                    out.push(':');
                }
            }
            out.push('\n');
        }
        out
    }

}

pub use self::core::{NodeId, OrgDocument, OrgEnv, OrgError, OrgNode, PropertyValue};
pub use self::date::{
    ClockEntry, DatePoint, RepeatedTask, Repeater, RepeaterMark, TimeUnit, Timestamp, Warning,
    parse_duration, scan_timestamps,
};
pub use self::format::{render_document, render_outline};
pub use self::parser::{load, loads, parse, parse_with_env};
