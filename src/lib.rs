//! Backtracking regular-expression matcher over a compiled group automaton.
//!
//! A pattern is compiled into a flat array of [`State`]s addressed by
//! [`StateIdx`].  Three kinds of states do the work:
//!
//! - **Ordinary** states test one input byte against a [`ByteClass`] and
//!   advance.  A single-symbol repetition (`a*`, `\d{2,4}`) is one ordinary
//!   state that loops on itself up to `max` times.  An ordinary state with
//!   `max == 0` never consumes input: it is an empty match, optionally guarded
//!   by a zero-width [`AssertKind`].
//! - **Alpha** states open a group (capture group, alternation, or repetition
//!   of anything larger than one symbol).  They own the group's bounds,
//!   capture slot and branch list, and they decide on every pass whether the
//!   group iterates once more or exits.
//! - **End** states close the group opened by their owning alpha and hand
//!   control back to it.
//!
//! Two sentinels terminate the array: the *reject* terminal (second-to-last)
//! and the *accept* terminal (last).
//!
//! # Layout
//!
//! ```text
//! (ab|c)+d   compiles to
//!
//!  0 Alpha{1,1} cap 0 ─┬─> 1 Alpha{1,∞} cap 1 ─┬─> 2 'a' ─> 3 'b' ─┬─> 5 End(1) ─> 1
//!                      │                       └─> 4 'c' ──────────┘
//!                      │                  exit: 6 'd' ─> 7 End(0) ─> 0
//!                      └────────────────── exit: 9 Accept          (8 is Reject)
//! ```
//!
//! A group's states sit contiguously between its alpha and its End
//! (`close`), so "the descendants of an alpha" is an id range.
//!
//! # Matching
//!
//! The [`Automaton`] is immutable and can be shared by any number of
//! [`Session`]s.  Everything that changes while matching (visit counts,
//! restore cursors, captures, the retry stack, alternation choices) lives in
//! the session, in arrays indexed by [`StateIdx`].
//!
//! Every step returns a `Transition`: advance to a state (possibly
//! consuming a byte), fall through to a state without consuming, or
//! backtrack.  Backtracking pops the most recent retry snapshot.  Snapshots
//! are pushed at each decision point:
//!
//! - before an alpha tries one more (optional) iteration: the snapshot resumes
//!   at the group's exit with the iteration undone;
//! - before an alpha enters branch `i` of an alternation while branch `i + 1`
//!   exists: the snapshot resumes at the alpha itself with branch `i + 1`
//!   pinned in the [`AlternationCoordinator`];
//! - before a repeatable ordinary state consumes beyond its minimum: the
//!   snapshot resumes at the state's continuation.
//!
//! A snapshot does not copy the session eagerly.  While it is the top of the
//! stack, the first mutation of any state's progress records that state's
//! previous progress (and capture) into the snapshot.  Popping it replays the
//! records in reverse, which restores every state and capture changed since
//! the push, however far the walk went in the meantime.
//!
//! Repetition is greedy: an alpha always prefers one more iteration and only
//! falls back to exiting when the remainder fails.  An iteration that matched
//! the empty string ends the repetition, so nullable bodies such as
//! `(a*)*` terminate.

use std::fmt;
use std::io::{self, Write};
use std::ops::{Index, Range};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use log::{debug, trace};
use regex_syntax::hir::{self, HirKind};
use thiserror::Error;

/// Re-export so users do not need a direct `regex-syntax` dependency.
pub use regex_syntax::hir::Hir;

/// Upper bound used for unbounded repetitions (`*`, `+`, `{n,}`).
pub const UNBOUNDED: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors returned while compiling a pattern or loading an automaton.
///
/// Matching itself never fails: a well-formed automaton either matches or
/// it doesn't.
#[derive(Error, Debug, PartialEq)]
pub enum Error {
    /// The pattern could not be parsed.
    #[error(transparent)]
    Syntax(#[from] regex_syntax::Error),

    /// A Unicode character class that cannot be lowered to single bytes
    /// (i.e. contains codepoints above U+00FF).
    #[error("unsupported character class: {0:?}")]
    UnsupportedClass(hir::Class),

    /// A look-around assertion without a byte-level meaning (e.g. a Unicode
    /// word boundary).
    #[error("unsupported look-around assertion: {0:?}")]
    UnsupportedLook(hir::Look),

    /// Non-greedy repetitions (`*?`, `+?`, `{n,m}?`).
    #[error("lazy repetitions are not supported")]
    UnsupportedLazy,

    #[error("an automaton needs a root alpha state followed by reject and accept terminals")]
    MissingSentinels,

    #[error("state {state} refers to state {target}, which does not exist")]
    DanglingState { state: StateIdx, target: StateIdx },

    #[error("owner {owner} of state {state} is not an alpha state")]
    OwnerNotAlpha { state: StateIdx, owner: StateIdx },

    #[error("the owners of state {0} do not lead back to the root")]
    OwnerCycle(StateIdx),

    #[error("alpha state {alpha} is not closed by an end state at {close}")]
    BadClose { alpha: StateIdx, close: StateIdx },

    #[error("alpha state {0} has no branches")]
    NoBranches(StateIdx),

    #[error("state {state} has bounds {{{min},{max}}}")]
    InvalidBounds { state: StateIdx, min: u32, max: u32 },

    #[error("state {state} refers to class {class}, which does not exist")]
    DanglingClass { state: StateIdx, class: usize },

    #[error("state {0} may consume input but has no symbol class")]
    MissingClass(StateIdx),

    #[error("zero-width state {0} loops onto itself")]
    ZeroWidthLoop(StateIdx),

    #[error("repeatable state {0} carries an end anchor")]
    AnchoredRepetition(StateIdx),

    #[error("capture group {capture} of state {state} is out of range or owned twice")]
    BadCapture { state: StateIdx, capture: u32 },
}

// ---------------------------------------------------------------------------
// Symbol classes
// ---------------------------------------------------------------------------

/// A 256-entry boolean lookup table indicating which byte values belong
/// to a character class.  `class[b]` is `true` when byte `b` matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ByteClass([bool; 256]);

impl ByteClass {
    /// A class that matches every byte value.
    pub const ALL: Self = Self([true; 256]);

    /// A class that matches no byte value.
    pub const NONE: Self = Self([false; 256]);

    /// A class matching exactly `byte`.
    pub fn byte(byte: u8) -> Self {
        let mut class = Self::NONE;
        class.0[byte as usize] = true;
        class
    }

    /// Add every byte in `start..=end`.
    pub fn insert_range(&mut self, start: u8, end: u8) {
        for b in start..=end {
            self.0[b as usize] = true;
        }
    }

    /// Number of byte values in the class.
    pub fn len(&self) -> usize {
        self.0.iter().filter(|&&b| b).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `class[byte]` — test whether a byte matches this class.
impl Index<u8> for ByteClass {
    type Output = bool;

    #[inline]
    fn index(&self, byte: u8) -> &bool {
        &self.0[byte as usize]
    }
}

/// Index into the byte-class lookup tables of an [`Automaton`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClassIdx(usize);

impl ClassIdx {
    pub const fn new(idx: usize) -> Self {
        Self(idx)
    }

    #[inline]
    pub fn idx(self) -> usize {
        self.0
    }
}

/// `classes[class_idx]` — typed access to byte-class lookup tables.
impl Index<ClassIdx> for [ByteClass] {
    type Output = ByteClass;

    #[inline]
    fn index(&self, idx: ClassIdx) -> &ByteClass {
        &self[idx.idx()]
    }
}

/// The alphabet predicate: does `state` accept `symbol`?
///
/// The matching core never looks inside a state's symbol test; it only asks
/// this question once per state per input position.
pub trait Alphabet {
    fn accepts(&self, state: StateIdx, symbol: u8) -> bool;
}

// ---------------------------------------------------------------------------
// Zero-width assertions
// ---------------------------------------------------------------------------

/// The kind of zero-width assertion carried by an empty ordinary state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssertKind {
    /// `^`  — start of input only.
    Start,
    /// `$`  — end of input only.
    End,
    /// `(?m:^)` — start of any line (LF-terminated).
    StartLF,
    /// `(?m:$)` — end of any line (LF-terminated).
    EndLF,
    /// `(?Rm:^)` — start of any line (CRLF-aware).
    ///
    /// Holds at the start of input, immediately after `\n`, or immediately
    /// after `\r` **unless** a `\n` follows.
    StartCRLF,
    /// `(?Rm:$)` — end of any line (CRLF-aware).
    ///
    /// Holds at the end of input, immediately before `\r`, or immediately
    /// before `\n` **unless** `\r` precedes.
    EndCRLF,
    /// `\b` over ASCII word bytes.
    WordAscii,
    /// `\B` over ASCII word bytes.
    WordAsciiNegate,
}

impl AssertKind {
    /// Lower a `regex-syntax` look-around to a byte-level assertion.
    fn from_look(look: hir::Look) -> Result<Self, Error> {
        Ok(match look {
            hir::Look::Start => AssertKind::Start,
            hir::Look::End => AssertKind::End,
            hir::Look::StartLF => AssertKind::StartLF,
            hir::Look::EndLF => AssertKind::EndLF,
            hir::Look::StartCRLF => AssertKind::StartCRLF,
            hir::Look::EndCRLF => AssertKind::EndCRLF,
            hir::Look::WordAscii => AssertKind::WordAscii,
            hir::Look::WordAsciiNegate => AssertKind::WordAsciiNegate,
            _ => return Err(Error::UnsupportedLook(look)),
        })
    }

    /// Evaluate this assertion at position `at` of `input`.
    ///
    /// The whole input is known, so unlike a streaming matcher there is
    /// never a need to defer the decision until the next byte arrives.
    pub fn holds(self, input: &[u8], at: usize) -> bool {
        let prev = at.checked_sub(1).and_then(|i| input.get(i).copied());
        let next = input.get(at).copied();
        match self {
            AssertKind::Start => at == 0,
            AssertKind::End => at >= input.len(),
            AssertKind::StartLF => at == 0 || prev == Some(b'\n'),
            AssertKind::EndLF => at >= input.len() || next == Some(b'\n'),
            AssertKind::StartCRLF => match prev {
                None | Some(b'\n') => true,
                // \r\n is a single line terminator.
                Some(b'\r') => next != Some(b'\n'),
                Some(_) => false,
            },
            AssertKind::EndCRLF => match next {
                None | Some(b'\r') => true,
                Some(b'\n') => prev != Some(b'\r'),
                Some(_) => false,
            },
            AssertKind::WordAscii => is_word_byte(prev) != is_word_byte(next),
            AssertKind::WordAsciiNegate => is_word_byte(prev) == is_word_byte(next),
        }
    }

    /// Dot-graph label for this assertion kind.
    fn label(self) -> &'static str {
        match self {
            AssertKind::Start => "^",
            AssertKind::End => "$",
            AssertKind::StartLF => "^LF",
            AssertKind::EndLF => "$LF",
            AssertKind::StartCRLF => "^CRLF",
            AssertKind::EndCRLF => "$CRLF",
            AssertKind::WordAscii => "\\\\b",
            AssertKind::WordAsciiNegate => "\\\\B",
        }
    }
}

#[inline]
fn is_word_byte(byte: Option<u8>) -> bool {
    byte.is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
}

// ---------------------------------------------------------------------------
// Automaton states
// ---------------------------------------------------------------------------

/// Index into the state array of an [`Automaton`].
///
/// [`StateIdx::NONE`] marks unpatched transitions during construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateIdx(u32);

impl StateIdx {
    /// Sentinel value for transitions that have not been patched yet.
    pub const NONE: Self = Self(u32::MAX);

    pub const fn new(idx: u32) -> Self {
        Self(idx)
    }

    /// Return the raw index as `usize`.  Panics on `NONE` in debug builds.
    #[inline]
    pub fn idx(self) -> usize {
        debug_assert!(self != Self::NONE, "StateIdx::NONE used as index");
        self.0 as usize
    }

    /// Return the raw index as `usize` **without** asserting against `NONE`.
    /// Use only where `NONE` is a valid/expected value (e.g. bounds checks).
    #[inline]
    fn raw(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StateIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `states[state_idx]` — typed access to the state array.
impl Index<StateIdx> for [State] {
    type Output = State;

    #[inline]
    fn index(&self, idx: StateIdx) -> &State {
        &self[idx.idx()]
    }
}

/// What a state does when the walk reaches it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateKind {
    /// Consumes one byte accepted by `class`, up to `max` times.
    ///
    /// With `max == 0` the state never consumes: it is satisfied without
    /// consulting the alphabet, provided `look` (if any) holds.
    Ordinary {
        class: Option<ClassIdx>,
        look: Option<AssertKind>,
    },
    /// Opens a group.  `branches` are the entry states of its alternatives
    /// (one for a plain group); `close` is the group's End state.
    Alpha {
        branches: Box<[StateIdx]>,
        close: StateIdx,
    },
    /// Closes the group opened by the state's `owner`.
    End,
    /// Dead end: the current path fails.
    Reject,
    /// The whole pattern matched.
    Accept,
}

/// One node of the compiled automaton.
///
/// Only topology and compile-time flags live here; per-match progress is
/// kept by the [`Session`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct State {
    pub kind: StateKind,
    /// Where to go after consuming a symbol (ordinary), after passing
    /// (zero-width), or the first branch (alpha).  End states point back at
    /// their alpha.
    pub next: StateIdx,
    /// Where to go once the state is done repeating (ordinary) or the group
    /// exits (alpha).  Single-visit states point at the reject terminal.
    pub fail_next: StateIdx,
    /// The alpha state of the innermost group containing this state.  The
    /// root alpha owns itself.
    pub owner: StateIdx,
    pub min: u32,
    pub max: u32,
    /// Capture slot written by an alpha state.
    pub capture: Option<u32>,
    /// Alpha only: the group may only be entered at the start of input.
    pub anchor_begin: bool,
    /// Single-visit ordinary only: the consumed symbol must be the last one.
    pub anchor_end: bool,
}

impl State {
    /// A single-visit symbol test.
    pub fn ordinary(class: ClassIdx, owner: StateIdx) -> Self {
        Self::new(
            StateKind::Ordinary {
                class: Some(class),
                look: None,
            },
            owner,
            1,
            1,
        )
    }

    /// An empty match, guarded by `look` when given.
    pub fn assertion(look: Option<AssertKind>, owner: StateIdx) -> Self {
        Self::new(StateKind::Ordinary { class: None, look }, owner, 0, 0)
    }

    /// A group entry.  Its branches and close state are filled in once the
    /// body is laid out.
    pub fn alpha(owner: StateIdx, min: u32, max: u32, capture: Option<u32>) -> Self {
        let mut state = Self::new(
            StateKind::Alpha {
                branches: Box::default(),
                close: StateIdx::NONE,
            },
            owner,
            min,
            max,
        );
        state.capture = capture;
        state
    }

    /// The End marker of the group opened by `owner`.
    pub fn end(owner: StateIdx) -> Self {
        let mut state = Self::new(StateKind::End, owner, 1, 1);
        state.next = owner;
        state
    }

    /// The reject or accept sentinel.
    pub fn terminal(kind: StateKind) -> Self {
        Self::new(kind, StateIdx::NONE, 0, 0)
    }

    fn new(kind: StateKind, owner: StateIdx, min: u32, max: u32) -> Self {
        Self {
            kind,
            next: StateIdx::NONE,
            fail_next: StateIdx::NONE,
            owner,
            min,
            max,
            capture: None,
            anchor_begin: false,
            anchor_end: false,
        }
    }

    /// Zero iterations satisfy the state.
    #[inline]
    pub fn optional(&self) -> bool {
        self.min == 0
    }

    /// The state may be visited more than once per pass.
    #[inline]
    pub fn repeatable(&self) -> bool {
        self.max > 1
    }

    fn is_alpha(&self) -> bool {
        matches!(self.kind, StateKind::Alpha { .. })
    }

    fn is_terminal(&self) -> bool {
        matches!(self.kind, StateKind::Reject | StateKind::Accept)
    }
}

// ---------------------------------------------------------------------------
// Compiled automaton
// ---------------------------------------------------------------------------

struct StateList(Box<[State]>);

impl fmt::Debug for StateList {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_map().entries(self.0.iter().enumerate()).finish()
    }
}

impl std::ops::Deref for StateList {
    type Target = [State];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A compiled, validated automaton ready for matching.
///
/// Immutable once built; share it freely between sessions and threads.
#[derive(Debug)]
pub struct Automaton {
    states: StateList,
    /// Byte-class lookup tables referenced by ordinary states.
    classes: Box<[ByteClass]>,
    /// One entry per capture group (group 0 is the whole match).
    capture_names: Box<[Option<Box<str>>]>,
}

impl Automaton {
    /// Load an automaton produced by a compiler, checking its structural
    /// invariants once so that matching never has to.
    pub fn new(
        states: Vec<State>,
        classes: Vec<ByteClass>,
        capture_names: Vec<Option<Box<str>>>,
    ) -> Result<Self, Error> {
        let automaton = Self {
            states: StateList(states.into_boxed_slice()),
            classes: classes.into_boxed_slice(),
            capture_names: capture_names.into_boxed_slice(),
        };
        automaton.validate()?;
        Ok(automaton)
    }

    /// The synthetic root alpha state.
    #[inline]
    pub fn root(&self) -> StateIdx {
        StateIdx(0)
    }

    #[inline]
    pub fn reject(&self) -> StateIdx {
        StateIdx((self.states.len() - 2) as u32)
    }

    #[inline]
    pub fn accept(&self) -> StateIdx {
        StateIdx((self.states.len() - 1) as u32)
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn classes(&self) -> &[ByteClass] {
        &self.classes
    }

    /// Number of capture slots, including group 0.
    pub fn capture_len(&self) -> usize {
        self.capture_names.len()
    }

    /// Resolve a named group to its index.
    pub fn capture_index(&self, name: &str) -> Option<usize> {
        self.capture_names
            .iter()
            .position(|n| n.as_deref() == Some(name))
    }

    /// Try to match starting exactly at `start`.
    pub fn match_at(&self, input: &[u8], start: usize) -> Option<CaptureTable> {
        match_at(self, input, start)
    }

    /// Leftmost match in `input`.
    pub fn find_first(&self, input: &[u8]) -> Option<CaptureTable> {
        find_first(self, input)
    }

    pub fn is_match(&self, input: &[u8]) -> bool {
        self.find_first(input).is_some()
    }

    /// Return the total memory footprint (in bytes) of this automaton,
    /// including both inline and heap-allocated data.
    pub fn memory_size(&self) -> usize {
        let inline = std::mem::size_of::<Self>();
        let states_alloc = self.states.len() * std::mem::size_of::<State>();
        let branches_alloc: usize = self
            .states
            .iter()
            .map(|state| match &state.kind {
                StateKind::Alpha { branches, .. } => {
                    branches.len() * std::mem::size_of::<StateIdx>()
                }
                _ => 0,
            })
            .sum();
        let classes_alloc = self.classes.len() * std::mem::size_of::<ByteClass>();
        let names_alloc: usize = self
            .capture_names
            .iter()
            .map(|name| {
                std::mem::size_of::<Option<Box<str>>>() + name.as_ref().map_or(0, |n| n.len())
            })
            .sum();
        inline + states_alloc + branches_alloc + classes_alloc + names_alloc
    }

    /// Emit a Graphviz DOT representation of the automaton.
    pub fn to_dot(&self, mut buffer: impl Write) -> io::Result<()> {
        writeln!(buffer, "digraph automaton {{")?;
        writeln!(buffer, "\trankdir=LR;")?;
        for (i, state) in self.states.iter().enumerate() {
            let idx = StateIdx(i as u32);
            writeln!(buffer, "\t// [{}] {:?}", idx, state.kind)?;
            self.write_dot_state(idx, state, &mut buffer)?;
        }
        writeln!(buffer, "}}")
    }

    fn write_dot_state(
        &self,
        idx: StateIdx,
        state: &State,
        buffer: &mut impl Write,
    ) -> io::Result<()> {
        let bounds = match (state.min, state.max) {
            (1, 1) => String::new(),
            (0, 1) => "?".to_owned(),
            (0, UNBOUNDED) => "*".to_owned(),
            (1, UNBOUNDED) => "+".to_owned(),
            (min, UNBOUNDED) => format!("{{{},}}", min),
            (min, max) => format!("{{{},{}}}", min, max),
        };
        match &state.kind {
            StateKind::Ordinary { class, look } => {
                let label = match (class, look) {
                    (Some(class), _) => self.class_label(*class),
                    (None, Some(kind)) => kind.label().to_owned(),
                    (None, None) => "ε".to_owned(),
                };
                let anchor = if state.anchor_end { "$" } else { "" };
                writeln!(
                    buffer,
                    "\t{} -> {} [label=\"{}{}{}\"];",
                    idx, state.next, label, bounds, anchor
                )?;
                if state.fail_next != self.reject() && state.fail_next != state.next {
                    writeln!(buffer, "\t{} -> {} [style=dashed];", idx, state.fail_next)?;
                }
            }
            StateKind::Alpha { branches, .. } => {
                let capture = state.capture.map_or(String::new(), |c| format!(" cap {}", c));
                let anchor = if state.anchor_begin { "^" } else { "" };
                writeln!(
                    buffer,
                    "\t{} [shape=box, label=\"{}α{}{}{}\"];",
                    idx, anchor, idx, bounds, capture
                )?;
                for (n, branch) in branches.iter().enumerate() {
                    writeln!(buffer, "\t{} -> {} [label=\"alt-{}\"];", idx, branch, n)?;
                }
                writeln!(
                    buffer,
                    "\t{} -> {} [label=\"exit\", style=dashed];",
                    idx, state.fail_next
                )?;
            }
            StateKind::End => {
                writeln!(buffer, "\t{} -> {} [label=\"close\", style=dotted];", idx, state.next)?;
            }
            StateKind::Reject => {
                writeln!(buffer, "\t{} [shape=octagon];", idx)?;
            }
            StateKind::Accept => {
                writeln!(buffer, "\t{} [peripheries=2];", idx)?;
            }
        }
        Ok(())
    }

    fn class_label(&self, class: ClassIdx) -> String {
        let table = &self.classes[class];
        if table.len() == 256 {
            return ".".to_owned();
        }
        let mut members = (0..=255u8).filter(|&b| table[b]);
        match (members.next(), members.next()) {
            (Some(byte), None) => byte.escape_ascii().to_string(),
            _ => format!("[{}B]", table.len()),
        }
    }

    fn validate(&self) -> Result<(), Error> {
        let len = self.states.len();
        if len < 3
            || self.states[len - 1].kind != StateKind::Accept
            || self.states[len - 2].kind != StateKind::Reject
            || !self.states[self.root()].is_alpha()
            || self.states[self.root()].owner != self.root()
        {
            return Err(Error::MissingSentinels);
        }

        let in_range = |state: StateIdx, target: StateIdx| {
            if target.raw() < len {
                Ok(())
            } else {
                Err(Error::DanglingState { state, target })
            }
        };
        let mut capture_owned = vec![false; self.capture_names.len()];

        for (i, state) in self.states.iter().enumerate() {
            let idx = StateIdx(i as u32);
            if state.is_terminal() {
                continue;
            }
            in_range(idx, state.next)?;
            in_range(idx, state.fail_next)?;
            in_range(idx, state.owner)?;
            if !self.states[state.owner].is_alpha() {
                return Err(Error::OwnerNotAlpha {
                    state: idx,
                    owner: state.owner,
                });
            }
            if state.min > state.max {
                return Err(Error::InvalidBounds {
                    state: idx,
                    min: state.min,
                    max: state.max,
                });
            }
            if state.anchor_end && state.max != 1 {
                return Err(Error::AnchoredRepetition(idx));
            }
            if let (Some(capture), false) = (state.capture, state.is_alpha()) {
                return Err(Error::BadCapture { state: idx, capture });
            }
            match &state.kind {
                StateKind::Ordinary { class, .. } => match class {
                    Some(class) if class.idx() >= self.classes.len() => {
                        return Err(Error::DanglingClass {
                            state: idx,
                            class: class.idx(),
                        })
                    }
                    None if state.max != 0 => return Err(Error::MissingClass(idx)),
                    _ if state.max == 0 && state.next == idx => {
                        return Err(Error::ZeroWidthLoop(idx))
                    }
                    _ => {}
                },
                StateKind::Alpha { branches, close } => {
                    if branches.is_empty() {
                        return Err(Error::NoBranches(idx));
                    }
                    for &branch in branches.iter() {
                        in_range(idx, branch)?;
                    }
                    let closed = close.raw() < len
                        && *close > idx
                        && self.states[*close].kind == StateKind::End
                        && self.states[*close].owner == idx;
                    if !closed {
                        return Err(Error::BadClose {
                            alpha: idx,
                            close: *close,
                        });
                    }
                    if let Some(capture) = state.capture {
                        match capture_owned.get_mut(capture as usize) {
                            Some(owned) if !*owned => *owned = true,
                            _ => return Err(Error::BadCapture { state: idx, capture }),
                        }
                    }
                }
                StateKind::End | StateKind::Reject | StateKind::Accept => {}
            }
        }

        // Owners form a tree rooted at state 0.
        for i in 1..len - 2 {
            let start = StateIdx(i as u32);
            let mut current = start;
            let mut hops = 0;
            while current != self.root() {
                current = self.states[current].owner;
                hops += 1;
                if hops > len {
                    return Err(Error::OwnerCycle(start));
                }
            }
        }
        Ok(())
    }
}

impl Alphabet for Automaton {
    #[inline]
    fn accepts(&self, state: StateIdx, symbol: u8) -> bool {
        match &self.states[state].kind {
            StateKind::Ordinary {
                class: Some(class), ..
            } => self.classes[*class][symbol],
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Builder (regex-syntax HIR -> automaton)
// ---------------------------------------------------------------------------

/// A transition left dangling while a fragment is laid out.
#[derive(Clone, Copy, Debug)]
enum Hole {
    Next(StateIdx),
    FailNext(StateIdx),
}

/// A partially-built piece of the automaton with a `start` state and the
/// transitions that must be patched to whatever follows it.
#[derive(Debug)]
struct Fragment {
    start: StateIdx,
    holes: Vec<Hole>,
}

/// Builds a compiled [`Automaton`] from a pattern or a
/// [`regex_syntax::hir::Hir`].
///
/// States are emitted in pattern order, each group laid out as
/// `alpha, body…, end` so that the group's descendants form a contiguous id
/// range.  Patterns are handled in byte mode: Unicode is off and `.` may
/// match bytes that are not valid UTF-8.
#[derive(Debug, Default)]
pub struct RegexBuilder {
    states: Vec<State>,
    /// Deduplicated byte-class lookup tables.
    classes: IndexSet<ByteClass>,
    capture_names: Vec<Option<Box<str>>>,
    case_insensitive: bool,
    multi_line: bool,
    dot_matches_new_line: bool,
    crlf: bool,
}

impl RegexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match letters regardless of case (`(?i)`).
    pub fn case_insensitive(&mut self, yes: bool) -> &mut Self {
        self.case_insensitive = yes;
        self
    }

    /// Make `^` and `$` match at line boundaries (`(?m)`).
    pub fn multi_line(&mut self, yes: bool) -> &mut Self {
        self.multi_line = yes;
        self
    }

    /// Make `.` match `\n` (`(?s)`).
    pub fn dot_matches_new_line(&mut self, yes: bool) -> &mut Self {
        self.dot_matches_new_line = yes;
        self
    }

    /// Treat `\r\n` as a line terminator in multi-line mode (`(?R)`).
    pub fn crlf(&mut self, yes: bool) -> &mut Self {
        self.crlf = yes;
        self
    }

    /// Parse `pattern` and compile it.
    pub fn parse(&mut self, pattern: &str) -> Result<Automaton, Error> {
        let hir = regex_syntax::ParserBuilder::new()
            .unicode(false)
            .utf8(false)
            .case_insensitive(self.case_insensitive)
            .multi_line(self.multi_line)
            .dot_matches_new_line(self.dot_matches_new_line)
            .crlf(self.crlf)
            .build()
            .parse(pattern)?;
        self.build(&hir)
    }

    /// Compile an already-parsed HIR.
    pub fn build(&mut self, hir: &Hir) -> Result<Automaton, Error> {
        self.states.clear();
        self.classes.clear();
        self.capture_names = vec![None; hir.properties().explicit_captures_len() + 1];

        let root = StateIdx(0);
        let body = self.compile_group(root, 1, 1, Some(0), hir)?;
        let reject = self.push(State::terminal(StateKind::Reject));
        let accept = self.push(State::terminal(StateKind::Accept));
        self.patch(&body.holes, accept);
        for state in self.states.iter_mut().filter(|s| !s.is_terminal()) {
            if state.fail_next == StateIdx::NONE {
                state.fail_next = reject;
            }
        }

        debug!(
            "compiled automaton: {} states, {} classes, {} capture groups",
            self.states.len(),
            self.classes.len(),
            self.capture_names.len()
        );

        Automaton::new(
            std::mem::take(&mut self.states),
            self.classes.drain(..).collect(),
            std::mem::take(&mut self.capture_names),
        )
    }

    fn push(&mut self, state: State) -> StateIdx {
        let idx = StateIdx(self.states.len() as u32);
        self.states.push(state);
        idx
    }

    fn single(&mut self, state: State) -> Fragment {
        let idx = self.push(state);
        Fragment {
            start: idx,
            holes: vec![Hole::Next(idx)],
        }
    }

    fn patch(&mut self, holes: &[Hole], target: StateIdx) {
        for hole in holes {
            match *hole {
                Hole::Next(s) => self.states[s.idx()].next = target,
                Hole::FailNext(s) => self.states[s.idx()].fail_next = target,
            }
        }
    }

    /// Return the index of `table` in `self.classes`, inserting it if it
    /// is not already present.
    fn intern_class(&mut self, table: ByteClass) -> ClassIdx {
        let (idx, _) = self.classes.insert_full(table);
        ClassIdx(idx)
    }

    fn lower_class(&mut self, class: &hir::Class) -> Result<ClassIdx, Error> {
        let mut table = ByteClass::NONE;
        match class {
            hir::Class::Bytes(bytes) => {
                for range in bytes.ranges() {
                    table.insert_range(range.start(), range.end());
                }
            }
            hir::Class::Unicode(unicode) => {
                // Unicode classes may still appear for ASCII-only input like
                // `(?i)k`.  Lower them when every range fits in a byte.
                let ranges = unicode.ranges();
                if !ranges.iter().all(|r| u32::from(r.end()) <= 0xFF) {
                    return Err(Error::UnsupportedClass(class.clone()));
                }
                for range in ranges {
                    table.insert_range(range.start() as u8, range.end() as u8);
                }
            }
        }
        Ok(self.intern_class(table))
    }

    fn name_capture(&mut self, capture: &hir::Capture) {
        if let Some(slot) = self.capture_names.get_mut(capture.index as usize) {
            *slot = capture.name.clone();
        }
    }

    fn compile(&mut self, hir: &Hir, owner: StateIdx) -> Result<Fragment, Error> {
        match hir.kind() {
            HirKind::Empty => Ok(self.single(State::assertion(None, owner))),
            HirKind::Literal(lit) => {
                let mut first: Option<StateIdx> = None;
                let mut last: Option<StateIdx> = None;
                for &byte in lit.0.iter() {
                    let class = self.intern_class(ByteClass::byte(byte));
                    let idx = self.push(State::ordinary(class, owner));
                    match last {
                        Some(prev) => self.states[prev.idx()].next = idx,
                        None => first = Some(idx),
                    }
                    last = Some(idx);
                }
                match (first, last) {
                    (Some(start), Some(last)) => Ok(Fragment {
                        start,
                        holes: vec![Hole::Next(last)],
                    }),
                    _ => Ok(self.single(State::assertion(None, owner))),
                }
            }
            HirKind::Class(class) => {
                let class = self.lower_class(class)?;
                Ok(self.single(State::ordinary(class, owner)))
            }
            HirKind::Look(look) => {
                let kind = AssertKind::from_look(*look)?;
                Ok(self.single(State::assertion(Some(kind), owner)))
            }
            HirKind::Capture(capture) => {
                self.name_capture(capture);
                self.compile_group(owner, 1, 1, Some(capture.index), &capture.sub)
            }
            HirKind::Repetition(rep) => self.compile_repetition(rep, owner),
            HirKind::Concat(children) => self.compile_concat(children, owner),
            HirKind::Alternation(_) => self.compile_group(owner, 1, 1, None, hir),
        }
    }

    fn compile_repetition(
        &mut self,
        rep: &hir::Repetition,
        owner: StateIdx,
    ) -> Result<Fragment, Error> {
        if !rep.greedy {
            return Err(Error::UnsupportedLazy);
        }
        let min = rep.min;
        let max = rep.max.unwrap_or(UNBOUNDED);
        if max == 0 {
            return Ok(self.single(State::assertion(None, owner)));
        }
        // Single-symbol bodies repeat in place on one ordinary state.
        let class = match rep.sub.kind() {
            HirKind::Literal(lit) if lit.0.len() == 1 => {
                Some(self.intern_class(ByteClass::byte(lit.0[0])))
            }
            HirKind::Class(class) => Some(self.lower_class(class)?),
            _ => None,
        };
        if let Some(class) = class {
            let mut state = State::ordinary(class, owner);
            state.min = min;
            state.max = max;
            let idx = self.push(state);
            self.states[idx.idx()].next = idx;
            return Ok(Fragment {
                start: idx,
                holes: vec![Hole::FailNext(idx)],
            });
        }
        match rep.sub.kind() {
            HirKind::Capture(capture) => {
                self.name_capture(capture);
                self.compile_group(owner, min, max, Some(capture.index), &capture.sub)
            }
            _ => self.compile_group(owner, min, max, None, &rep.sub),
        }
    }

    fn compile_concat(&mut self, children: &[Hir], owner: StateIdx) -> Result<Fragment, Error> {
        let mut frag: Option<Fragment> = None;
        // Whether the previous child compiled to single-visit symbol states.
        let mut after_symbol = false;
        for child in children {
            if after_symbol && matches!(child.kind(), HirKind::Look(hir::Look::End)) {
                // `x$`: fold the anchor into the last symbol state.
                let last = self.states.len() - 1;
                self.states[last].anchor_end = true;
                after_symbol = false;
                continue;
            }
            let next = self.compile(child, owner)?;
            after_symbol = matches!(child.kind(), HirKind::Literal(_) | HirKind::Class(_));
            frag = Some(match frag {
                None => next,
                Some(prev) => {
                    self.patch(&prev.holes, next.start);
                    Fragment {
                        start: prev.start,
                        holes: next.holes,
                    }
                }
            });
        }
        match frag {
            Some(frag) => Ok(frag),
            None => Ok(self.single(State::assertion(None, owner))),
        }
    }

    /// Lay out `alpha, branches…, end` for a group with the given bounds.
    fn compile_group(
        &mut self,
        owner: StateIdx,
        min: u32,
        max: u32,
        capture: Option<u32>,
        body: &Hir,
    ) -> Result<Fragment, Error> {
        let alpha = self.push(State::alpha(owner, min, max, capture));
        let alternatives = match body.kind() {
            HirKind::Alternation(alternatives) => alternatives.as_slice(),
            _ => std::slice::from_ref(body),
        };
        // A leading `^` of a group entered exactly once is checked on entry.
        let fold_begin = alternatives.len() == 1 && min == 1 && max == 1;

        let mut branches = Vec::with_capacity(alternatives.len());
        let mut holes = Vec::new();
        for alternative in alternatives {
            let frag = match alternative.kind() {
                HirKind::Concat(children) if fold_begin && starts_at_input_start(children) => {
                    self.states[alpha.idx()].anchor_begin = true;
                    self.compile_concat(&children[1..], alpha)?
                }
                HirKind::Look(hir::Look::Start) if fold_begin => {
                    self.states[alpha.idx()].anchor_begin = true;
                    self.single(State::assertion(None, alpha))
                }
                _ => self.compile(alternative, alpha)?,
            };
            branches.push(frag.start);
            holes.extend(frag.holes);
        }

        let end = self.push(State::end(alpha));
        self.patch(&holes, end);
        let state = &mut self.states[alpha.idx()];
        state.next = branches[0];
        state.kind = StateKind::Alpha {
            branches: branches.into_boxed_slice(),
            close: end,
        };
        Ok(Fragment {
            start: alpha,
            holes: vec![Hole::FailNext(alpha)],
        })
    }
}

fn starts_at_input_start(children: &[Hir]) -> bool {
    children
        .first()
        .is_some_and(|first| matches!(first.kind(), HirKind::Look(hir::Look::Start)))
}

// ---------------------------------------------------------------------------
// Capture table
// ---------------------------------------------------------------------------

/// A half-open byte range `[start, end)` of the input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn range(self) -> Range<usize> {
        self.start..self.end
    }

    pub fn len(self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(self) -> bool {
        self.start == self.end
    }
}

impl From<Span> for Range<usize> {
    fn from(span: Span) -> Self {
        span.range()
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{})", self.start, self.end)
    }
}

/// Capture group spans of one match.  Group 0 is the whole match.
///
/// When a repetition re-enters a group, the span of the last iteration
/// wins.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CaptureTable {
    spans: Vec<Option<Span>>,
}

impl CaptureTable {
    fn reset(&mut self, len: usize) {
        self.spans.clear();
        self.spans.resize(len, None);
    }

    #[inline]
    fn set(&mut self, group: u32, span: Option<Span>) {
        if let Some(slot) = self.spans.get_mut(group as usize) {
            *slot = span;
        }
    }

    /// Span of `group`, or `None` if the group did not participate.
    #[inline]
    pub fn get(&self, group: usize) -> Option<Span> {
        self.spans.get(group).copied().flatten()
    }

    /// Span of the whole match.
    pub fn span(&self) -> Option<Span> {
        self.get(0)
    }

    /// Number of groups, including group 0.
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<Span>> + '_ {
        self.spans.iter().copied()
    }
}

// ---------------------------------------------------------------------------
// Alternation coordinator
// ---------------------------------------------------------------------------

/// Keeps track of which `|` branch each alternation group is exploring.
///
/// The session pins a branch index here when backtracking moves an
/// alternation group on to its next branch.
pub trait AlternationCoordinator {
    fn branch_index(&self, group: StateIdx) -> usize;
    fn set_branch_index(&mut self, group: StateIdx, index: usize);
}

/// Per-session branch choices, one slot per state.
#[derive(Clone, Debug, Default)]
pub struct BranchTable(Vec<usize>);

impl BranchTable {
    fn reset(&mut self, states: usize) {
        self.0.clear();
        self.0.resize(states, 0);
    }
}

impl AlternationCoordinator for BranchTable {
    #[inline]
    fn branch_index(&self, group: StateIdx) -> usize {
        self.0.get(group.idx()).copied().unwrap_or(0)
    }

    #[inline]
    fn set_branch_index(&mut self, group: StateIdx, index: usize) {
        if let Some(slot) = self.0.get_mut(group.idx()) {
            *slot = index;
        }
    }
}

// ---------------------------------------------------------------------------
// Retry stack
// ---------------------------------------------------------------------------

/// Per-session progress of one state.
///
/// Ordinary states only count symbols; End states keep no progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Progress {
    /// Symbols consumed (ordinary) or iterations started (alpha) in the
    /// current pass.
    visited: u32,
    /// Alpha: cursor at which the current iteration started.
    last_good: usize,
    /// Alpha: the group's lower bound is met, so it may exit.
    matched: bool,
}

impl Progress {
    fn fresh(state: &State) -> Self {
        Self {
            visited: 0,
            last_good: 0,
            matched: state.optional(),
        }
    }
}

/// The progress of one state (and its capture slot) before it was changed.
#[derive(Clone, Copy, Debug)]
struct ChildSnapshot {
    state: StateIdx,
    progress: Progress,
    capture: Option<Span>,
}

/// A decision point the walk can come back to.
#[derive(Clone, Debug)]
struct RetrySnapshot {
    /// The alpha state whose group owns the decision.
    alpha: StateIdx,
    resume_state: StateIdx,
    resume_cursor: usize,
    /// Alternation branch to pin before resuming.
    branch: Option<usize>,
    serial: usize,
    /// Pre-images of every state changed while this snapshot was on top.
    children: Vec<ChildSnapshot>,
}

#[derive(Clone, Debug, Default)]
struct RetryStack {
    snapshots: Vec<RetrySnapshot>,
    /// Per state: serial of the snapshot its pre-image was last recorded in.
    saved_in: Vec<usize>,
    serial: usize,
}

impl RetryStack {
    fn reset(&mut self, states: usize) {
        self.snapshots.clear();
        self.saved_in.clear();
        self.saved_in.resize(states, 0);
        self.serial = 0;
    }

    fn push(
        &mut self,
        alpha: StateIdx,
        resume_state: StateIdx,
        resume_cursor: usize,
        branch: Option<usize>,
    ) {
        self.serial += 1;
        self.snapshots.push(RetrySnapshot {
            alpha,
            resume_state,
            resume_cursor,
            branch,
            serial: self.serial,
            children: Vec::new(),
        });
    }

    fn pop(&mut self) -> Option<RetrySnapshot> {
        self.snapshots.pop()
    }

    /// Record `child` in the top snapshot unless that state was already
    /// recorded there.
    #[inline]
    fn record(&mut self, child: ChildSnapshot) {
        if let Some(top) = self.snapshots.last_mut() {
            let saved = &mut self.saved_in[child.state.idx()];
            if *saved != top.serial {
                *saved = top.serial;
                top.children.push(child);
            }
        }
    }

    /// Forget every decision point; the walk has committed.
    fn discard(&mut self) {
        self.snapshots.clear();
    }

    fn len(&self) -> usize {
        self.snapshots.len()
    }
}

// ---------------------------------------------------------------------------
// Session (automaton walk)
// ---------------------------------------------------------------------------

/// What to do after a state has been stepped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Transition {
    /// Continue at `next` with the cursor at `cursor`.
    Advance { next: StateIdx, cursor: usize },
    /// Continue at `next` without consuming input.
    FailThrough(StateIdx),
    /// The current path cannot succeed; resume the latest decision point.
    Backtrack,
}

/// One matching attempt context over an [`Automaton`] and an input.
///
/// All mutable state lives here, so sessions over the same automaton are
/// independent.  Cloning a session copies its progress and shares the
/// automaton.
#[derive(Clone, Debug)]
pub struct Session<'a> {
    automaton: &'a Automaton,
    input: &'a [u8],
    progress: Vec<Progress>,
    captures: CaptureTable,
    retry: RetryStack,
    branches: BranchTable,
    /// Set when backtracking resumes an alternation group on a pinned
    /// branch instead of starting a new iteration.
    alternation_retry: bool,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> Session<'a> {
    pub fn new(automaton: &'a Automaton, input: &'a [u8]) -> Self {
        Self {
            automaton,
            input,
            progress: Vec::with_capacity(automaton.states.len()),
            captures: CaptureTable::default(),
            retry: RetryStack::default(),
            branches: BranchTable::default(),
            alternation_retry: false,
            cancel: None,
        }
    }

    /// Abandon matching (with no match) once `flag` becomes `true`.  The
    /// flag is checked each time a symbol is consumed.
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn input(&self) -> &'a [u8] {
        self.input
    }

    /// Try to match the automaton starting exactly at `start`.
    pub fn try_match(&mut self, start: usize) -> Option<CaptureTable> {
        if start > self.input.len() {
            return None;
        }
        self.reset();

        let automaton = self.automaton;
        let reject = automaton.reject();
        let accept = automaton.accept();
        let mut current = automaton.root();
        let mut cursor = start;

        loop {
            if current == accept {
                self.retry.discard();
                debug!("match at {}: {:?}", start, self.captures.span());
                return Some(self.captures.clone());
            }
            if current == reject {
                match self.backtrack() {
                    Some((state, at)) => {
                        current = state;
                        cursor = at;
                        continue;
                    }
                    None => {
                        debug!("no match at {}", start);
                        return None;
                    }
                }
            }

            let transition = self.step(current, cursor);
            trace!("{} @ {}: {:?}", current, cursor, transition);
            match transition {
                Transition::Advance { next, cursor: at } => {
                    if at > cursor && self.cancelled() {
                        debug!("cancelled at {} (started at {})", at, start);
                        return None;
                    }
                    current = next;
                    cursor = at;
                }
                Transition::FailThrough(next) => current = next,
                Transition::Backtrack => current = reject,
            }
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Start a new attempt: every state back to its initial progress.
    fn reset(&mut self) {
        let automaton = self.automaton;
        self.progress.clear();
        self.progress
            .extend(automaton.states.iter().map(Progress::fresh));
        self.captures.reset(automaton.capture_len());
        self.retry.reset(automaton.states.len());
        self.branches.reset(automaton.states.len());
        self.alternation_retry = false;
    }

    /// Record the current progress of `idx` in the top retry snapshot
    /// before it changes.
    #[inline]
    fn save(&mut self, idx: StateIdx) {
        let capture = self.automaton.states[idx]
            .capture
            .and_then(|group| self.captures.get(group as usize));
        self.retry.record(ChildSnapshot {
            state: idx,
            progress: self.progress[idx.idx()],
            capture,
        });
    }

    fn step(&mut self, idx: StateIdx, cursor: usize) -> Transition {
        let automaton = self.automaton;
        let state = &automaton.states[idx];
        match &state.kind {
            StateKind::Ordinary { look, .. } => self.step_ordinary(idx, state, *look, cursor),
            StateKind::Alpha { branches, close } => {
                self.step_alpha(idx, state, branches, *close, cursor)
            }
            // The owning alpha decides whether the group iterates again.
            StateKind::End => Transition::Advance {
                next: state.owner,
                cursor,
            },
            // Terminals are resolved by the session loop.
            StateKind::Reject | StateKind::Accept => Transition::Backtrack,
        }
    }

    fn step_ordinary(
        &mut self,
        idx: StateIdx,
        state: &State,
        look: Option<AssertKind>,
        cursor: usize,
    ) -> Transition {
        if state.max == 0 {
            return match look {
                Some(kind) if !kind.holds(self.input, cursor) => Transition::Backtrack,
                _ => Transition::Advance {
                    next: state.next,
                    cursor,
                },
            };
        }

        let progress = self.progress[idx.idx()];
        if progress.visited >= state.max {
            return Transition::FailThrough(state.fail_next);
        }

        let accepted = self
            .input
            .get(cursor)
            .is_some_and(|&symbol| self.automaton.accepts(idx, symbol));
        if !accepted {
            // Enough repetitions already: skip forward.
            return if progress.visited >= state.min {
                Transition::FailThrough(state.fail_next)
            } else {
                Transition::Backtrack
            };
        }

        let end = cursor + 1;
        if state.anchor_end && end != self.input.len() {
            return Transition::FailThrough(self.automaton.reject());
        }
        if progress.visited >= state.min {
            // Consuming is optional here; on failure, stop before it.
            self.retry.push(state.owner, state.fail_next, cursor, None);
        }
        self.save(idx);
        self.progress[idx.idx()].visited += 1;
        Transition::Advance {
            next: state.next,
            cursor: end,
        }
    }

    /// Group entry, loop-back after an iteration, or branch retry.
    fn step_alpha(
        &mut self,
        idx: StateIdx,
        state: &State,
        branches: &[StateIdx],
        close: StateIdx,
        cursor: usize,
    ) -> Transition {
        if std::mem::take(&mut self.alternation_retry) {
            let branch = self.branches.branch_index(idx);
            return self.enter_branch(idx, branches, branch, cursor);
        }

        let progress = self.progress[idx.idx()];
        if progress.visited != 0 {
            // The iteration that started at `last_good` just closed.
            let zero_width = progress.last_good == cursor;
            if zero_width && state.max == UNBOUNDED && progress.visited > state.min.max(1) {
                // An empty pass through the open-ended part of a loop is
                // not an iteration; the exit taken before it is.
                return Transition::Backtrack;
            }
            self.save(idx);
            if let Some(group) = state.capture {
                self.captures
                    .set(group, Some(Span::new(progress.last_good, cursor)));
            }
            self.init_scope(idx, close);
            if zero_width {
                // Further iterations would match empty the same way, so the
                // remaining mandatory ones are satisfied by this one.
                let progress = &mut self.progress[idx.idx()];
                progress.visited = progress.visited.max(state.min);
                progress.matched = true;
                return Transition::FailThrough(state.fail_next);
            }
        } else if state.anchor_begin && cursor != 0 {
            return Transition::FailThrough(if state.optional() {
                state.fail_next
            } else {
                self.automaton.reject()
            });
        }
        self.iterate(idx, state, branches, cursor)
    }

    /// Start one more iteration of the group, or exit it.
    fn iterate(
        &mut self,
        idx: StateIdx,
        state: &State,
        branches: &[StateIdx],
        cursor: usize,
    ) -> Transition {
        let progress = self.progress[idx.idx()];
        if progress.visited >= state.max {
            return Transition::FailThrough(state.fail_next);
        }
        if progress.matched {
            self.retry.push(idx, state.fail_next, cursor, None);
        }
        self.save(idx);
        let progress = &mut self.progress[idx.idx()];
        progress.visited += 1;
        progress.last_good = cursor;
        progress.matched = progress.visited >= state.min;
        self.enter_branch(idx, branches, 0, cursor)
    }

    fn enter_branch(
        &mut self,
        idx: StateIdx,
        branches: &[StateIdx],
        branch: usize,
        cursor: usize,
    ) -> Transition {
        self.branches.set_branch_index(idx, branch);
        if branch + 1 < branches.len() {
            self.retry.push(idx, idx, cursor, Some(branch + 1));
        }
        Transition::Advance {
            next: branches[branch],
            cursor,
        }
    }

    /// Reset the per-iteration progress of every state strictly inside the
    /// group.  Capture slots are kept.
    fn init_scope(&mut self, alpha: StateIdx, close: StateIdx) {
        let automaton = self.automaton;
        for raw in alpha.raw() + 1..close.raw() {
            let idx = StateIdx(raw as u32);
            let fresh = Progress::fresh(&automaton.states[idx]);
            if self.progress[raw] != fresh {
                self.save(idx);
                self.progress[raw] = fresh;
            }
        }
    }

    /// Pop the latest decision point and roll its group back to it.
    ///
    /// Returns where to resume, or `None` once no decision point is left.
    fn backtrack(&mut self) -> Option<(StateIdx, usize)> {
        let snapshot = self.retry.pop()?;
        let automaton = self.automaton;
        for child in snapshot.children.iter().rev() {
            self.progress[child.state.idx()] = child.progress;
            if let Some(group) = automaton.states[child.state].capture {
                self.captures.set(group, child.capture);
            }
        }
        if let Some(branch) = snapshot.branch {
            self.branches.set_branch_index(snapshot.alpha, branch);
        }
        self.alternation_retry = snapshot.resume_state == snapshot.alpha;
        trace!(
            "backtrack into {} at {} (resume {}, {} left)",
            snapshot.alpha,
            snapshot.resume_cursor,
            snapshot.resume_state,
            self.retry.len()
        );
        Some((snapshot.resume_state, snapshot.resume_cursor))
    }
}

/// Match `automaton` against `input`, starting exactly at `start`.
pub fn match_at(automaton: &Automaton, input: &[u8], start: usize) -> Option<CaptureTable> {
    Session::new(automaton, input).try_match(start)
}

/// Find the leftmost match of `automaton` in `input`.
pub fn find_first(automaton: &Automaton, input: &[u8]) -> Option<CaptureTable> {
    let mut session = Session::new(automaton, input);
    // A root anchored at the start of input can only match at offset 0.
    let last = if automaton.states[automaton.root()].anchor_begin {
        0
    } else {
        input.len()
    };
    (0..=last).find_map(|start| session.try_match(start))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use itertools::Itertools;
    use pretty_assertions::assert_eq;

    use super::*;

    type Spans = Vec<Option<(usize, usize)>>;

    fn parse(pattern: &str) -> Automaton {
        RegexBuilder::new()
            .parse(pattern)
            .unwrap_or_else(|e| panic!("failed to compile {:?}: {}", pattern, e))
    }

    fn spans(table: &CaptureTable) -> Spans {
        table.iter().map(|s| s.map(|s| (s.start, s.end))).collect()
    }

    fn find(pattern: &str, input: &[u8]) -> Option<Spans> {
        parse(pattern).find_first(input).map(|table| spans(&table))
    }

    /// Every input over `alphabet` up to `max_len` bytes, shortest first.
    fn all_inputs(alphabet: &[u8], max_len: usize) -> Vec<Vec<u8>> {
        let mut inputs = vec![Vec::new()];
        for len in 1..=max_len {
            inputs.extend(
                std::iter::repeat(alphabet.iter().copied())
                    .take(len)
                    .multi_cartesian_product(),
            );
        }
        inputs
    }

    /// Compare the leftmost match and every capture group against the
    /// `regex` crate.  `flags` are inline flags applied to the oracle, and
    /// must correspond to how `builder` is configured.
    fn assert_matches_regex_crate(
        builder: &mut RegexBuilder,
        flags: &str,
        pattern: &str,
        inputs: &[Vec<u8>],
    ) {
        let automaton = builder
            .parse(pattern)
            .unwrap_or_else(|e| panic!("failed to compile {:?}: {}", pattern, e));
        let oracle = regex::bytes::Regex::new(&format!("(?{}-u){}", flags, pattern)).unwrap();
        for input in inputs {
            let expected = oracle.captures(input).map(|caps| {
                caps.iter()
                    .map(|m| m.map(|m| (m.start(), m.end())))
                    .collect::<Spans>()
            });
            let actual = automaton.find_first(input).map(|table| spans(&table));
            assert_eq!(
                actual,
                expected,
                "pattern {:?} on input \"{}\"",
                pattern,
                input.escape_ascii()
            );
        }
    }

    /// `(a|ab)c` laid out by hand, without the common-prefix rewrite the
    /// parser would apply.
    ///
    /// ```text
    /// 0 α{1,1} cap 0 -> 1 α{1,1} cap 1 ┬> 2 'a' ────────┬> 5 End(1) -> 1
    ///                                  └> 3 'a' -> 4 'b' ┘
    ///                  1 exit -> 6 'c' -> 7 End(0) -> 0;  0 exit -> 9 Accept
    /// ```
    fn manual_alternation() -> Parts {
        let s = StateIdx::new;
        let (a, b, c) = (ClassIdx::new(0), ClassIdx::new(1), ClassIdx::new(2));
        let link = |mut state: State, next: u32| {
            state.next = s(next);
            state.fail_next = s(8);
            state
        };

        let mut root = State::alpha(s(0), 1, 1, Some(0));
        root.kind = StateKind::Alpha {
            branches: vec![s(1)].into_boxed_slice(),
            close: s(7),
        };
        root.next = s(1);
        root.fail_next = s(9);

        let mut group = State::alpha(s(0), 1, 1, Some(1));
        group.kind = StateKind::Alpha {
            branches: vec![s(2), s(3)].into_boxed_slice(),
            close: s(5),
        };
        group.next = s(2);
        group.fail_next = s(6);

        let states = vec![
            root,
            group,
            link(State::ordinary(a, s(1)), 5),
            link(State::ordinary(a, s(1)), 4),
            link(State::ordinary(b, s(1)), 5),
            link(State::end(s(1)), 1),
            link(State::ordinary(c, s(0)), 7),
            link(State::end(s(0)), 0),
            State::terminal(StateKind::Reject),
            State::terminal(StateKind::Accept),
        ];
        let classes = vec![ByteClass::byte(b'a'), ByteClass::byte(b'b'), ByteClass::byte(b'c')];
        (states, classes, vec![None, None])
    }

    type Parts = (Vec<State>, Vec<ByteClass>, Vec<Option<Box<str>>>);

    fn load(parts: Parts) -> Result<Automaton, Error> {
        let (states, classes, names) = parts;
        Automaton::new(states, classes, names)
    }

    // -- Repetition -------------------------------------------------------

    #[test]
    fn test_bounded_repetition_is_greedy() {
        assert_eq!(find("a{2,3}b", b"aaab"), Some(vec![Some((0, 4))]));
        assert_eq!(find("(a{2,3})b", b"aaab"), Some(vec![Some((0, 4)), Some((0, 3))]));
        // Only the last three a's fit the upper bound.
        assert_eq!(find("a{2,3}b", b"aaaab"), Some(vec![Some((1, 5))]));
    }

    #[test]
    fn test_bounded_repetition_below_minimum() {
        let automaton = parse("a{2,3}b");
        assert_eq!(automaton.match_at(b"ab", 0), None);
        assert_eq!(automaton.find_first(b"ab"), None);
        assert!(!automaton.is_match(b"ab"));
    }

    #[test]
    fn test_last_iteration_wins() {
        assert_eq!(find("(ab)+", b"ababab"), Some(vec![Some((0, 6)), Some((4, 6))]));
    }

    #[test]
    fn test_greedy_group_gives_back_iterations() {
        for n in 0..10 {
            let input = vec![b'a'; n];
            let expected = (n >= 2).then(|| {
                let group = n.min(5);
                vec![Some((0, n)), Some((0, group)), Some((group, n))]
            });
            assert_eq!(find("^(a{2,5})(a*)$", &input), expected, "n = {}", n);
        }
    }

    #[test]
    fn test_repeated_bounded_group() {
        assert_eq!(find("(a{1,2}){2}", b"aa"), Some(vec![Some((0, 2)), Some((1, 2))]));
        assert_eq!(find("(a{1,2}){2}", b"aaa"), Some(vec![Some((0, 3)), Some((2, 3))]));
    }

    #[test]
    fn test_zero_width_iterations_terminate() {
        assert_eq!(find("(a*)*", b""), Some(vec![Some((0, 0)), Some((0, 0))]));
        assert_eq!(find("(a*)*", b"b"), Some(vec![Some((0, 0)), Some((0, 0))]));
        assert_eq!(find("(a*)*", b"aaa"), Some(vec![Some((0, 3)), Some((0, 3))]));
        assert_eq!(find("(?:a*)*b", b"aaab"), Some(vec![Some((0, 4))]));
        assert_eq!(find("((a*)*)*", b"aa").map(|s| s[0]), Some(Some((0, 2))));
        assert_eq!(find("(?:a?)+c", b"aac"), Some(vec![Some((0, 3))]));
    }

    #[test]
    fn test_zero_width_mandatory_iteration() {
        // The third iteration is required and matches empty.
        assert_eq!(find("(a?){3}", b"aa"), Some(vec![Some((0, 2)), Some((2, 2))]));
        assert_eq!(find("(a?){3}", b""), Some(vec![Some((0, 0)), Some((0, 0))]));
    }

    #[test]
    fn test_bounded_empty_iteration_is_the_last() {
        assert_eq!(find("(a?){1,2}", b"a"), Some(vec![Some((0, 1)), Some((1, 1))]));
        assert_eq!(
            find("(a{0,2}){2,3}b", b"aaab"),
            Some(vec![Some((0, 4)), Some((3, 3))])
        );
        // The empty pass of the outer loop is discarded with everything it
        // captured.
        assert_eq!(
            find("((ab|(){0,3}))*", b"ab"),
            Some(vec![Some((0, 2)), Some((0, 2)), Some((0, 2)), None])
        );
    }

    #[test]
    fn test_lazy_repetition_rejected() {
        assert_eq!(RegexBuilder::new().parse("a+?").unwrap_err(), Error::UnsupportedLazy);
        assert_eq!(RegexBuilder::new().parse("(ab){2,}?").unwrap_err(), Error::UnsupportedLazy);
    }

    // -- Alternation ------------------------------------------------------

    #[test]
    fn test_alternation_rolls_back() {
        assert_eq!(find("(a|ab)c", b"abc"), Some(vec![Some((0, 3)), Some((0, 2))]));
        assert_eq!(find("(a|ab)c", b"ac"), Some(vec![Some((0, 2)), Some((0, 1))]));
    }

    #[test]
    fn test_backtracking_across_groups() {
        assert_eq!(
            find("(a|ab)(c|bcd)(d*)", b"abcd"),
            Some(vec![Some((0, 4)), Some((0, 1)), Some((1, 4)), Some((4, 4))])
        );
    }

    #[test]
    fn test_manual_alternation_retry() {
        let automaton = load(manual_alternation()).unwrap();
        let mut session = Session::new(&automaton, b"abc");
        let table = session.try_match(0).unwrap();
        assert_eq!(spans(&table), vec![Some((0, 3)), Some((0, 2))]);
        // The second branch was pinned by backtracking and is still current.
        assert_eq!(session.branches.branch_index(StateIdx::new(1)), 1);
        assert_eq!(session.retry.len(), 0);

        assert_eq!(
            automaton.match_at(b"ac", 0).map(|t| spans(&t)),
            Some(vec![Some((0, 2)), Some((0, 1))])
        );
        assert_eq!(automaton.find_first(b"abd"), None);
        assert_eq!(automaton.find_first(b"xxabc").and_then(|t| t.span()), Some(Span::new(2, 5)));
    }

    #[test]
    fn test_branch_table() {
        let mut table = BranchTable::default();
        table.reset(4);
        assert_eq!(table.branch_index(StateIdx::new(2)), 0);
        table.set_branch_index(StateIdx::new(2), 3);
        assert_eq!(table.branch_index(StateIdx::new(2)), 3);
        assert_eq!(table.branch_index(StateIdx::new(1)), 0);
        table.reset(4);
        assert_eq!(table.branch_index(StateIdx::new(2)), 0);
    }

    #[test]
    fn test_earlier_iterations_keep_inner_captures() {
        assert_eq!(
            find("((a)|b)+", b"ab"),
            Some(vec![Some((0, 2)), Some((1, 2)), Some((0, 1))])
        );
    }

    // -- Anchors and assertions ------------------------------------------

    #[test]
    fn test_anchored_both_ends() {
        let automaton = parse("^a$");
        assert_eq!(automaton.find_first(b"a").map(|t| spans(&t)), Some(vec![Some((0, 1))]));
        assert_eq!(automaton.find_first(b"ab"), None);
        assert_eq!(automaton.find_first(b"ba"), None);
        assert_eq!(automaton.find_first(b""), None);
    }

    #[test]
    fn test_start_anchor_in_optional_group() {
        assert_eq!(find("(?:^)?b", b"ab"), Some(vec![Some((1, 2))]));
        assert_eq!(find("ab(^)*", b"ab"), Some(vec![Some((0, 2)), None]));
        assert_eq!(find("(^)*b+(ab)*", b"ab").map(|s| s[0]), Some(Some((1, 2))));
        assert_eq!(find("(c|(?:^){0,3})b", b"ab").map(|s| s[0]), Some(Some((1, 2))));
        assert_eq!(find("ab(b|ab)((?:^)?){2}", b"abb").map(|s| s[0]), Some(Some((0, 3))));
        assert!(!parse("(?:^)?b").states().iter().skip(1).any(|s| s.anchor_begin));
    }

    #[test]
    fn test_anchored_optional_alpha_is_skipped() {
        let compiled = parse("(ab)?c");
        let mut states = compiled.states().to_vec();
        assert!(states[1].optional());
        states[1].anchor_begin = true;
        let automaton = Automaton::new(
            states,
            compiled.classes().to_vec(),
            vec![None; compiled.capture_len()],
        )
        .unwrap();
        assert_eq!(
            automaton.find_first(b"xabc").map(|t| spans(&t)),
            Some(vec![Some((3, 4)), None])
        );
        assert_eq!(
            automaton.find_first(b"abc").map(|t| spans(&t)),
            Some(vec![Some((0, 3)), Some((0, 2))])
        );
    }

    #[test]
    fn test_anchors_fold_into_states() {
        let begin = parse("^ab");
        assert!(begin.states()[begin.root()].anchor_begin);
        assert_eq!(begin.find_first(b"xab"), None);
        assert_eq!(begin.find_first(b"abx").and_then(|t| t.span()), Some(Span::new(0, 2)));

        let end = parse("ab$");
        // root, 'a', 'b', End, Reject, Accept
        assert_eq!(end.states().len(), 6);
        assert!(end.states()[StateIdx::new(2)].anchor_end);
        assert_eq!(end.find_first(b"abab").and_then(|t| t.span()), Some(Span::new(2, 4)));
        assert_eq!(end.find_first(b"aba"), None);
    }

    #[test]
    fn test_assertions_hold() {
        let input = b"a\r\nb";
        assert!(AssertKind::Start.holds(input, 0));
        assert!(!AssertKind::Start.holds(input, 1));
        assert!(AssertKind::End.holds(input, 4));
        assert!(AssertKind::StartLF.holds(input, 3));
        assert!(AssertKind::EndLF.holds(input, 2));
        assert!(!AssertKind::EndLF.holds(input, 1));
        // No line boundary between \r and \n.
        assert!(!AssertKind::StartCRLF.holds(input, 2));
        assert!(!AssertKind::EndCRLF.holds(input, 2));
        assert!(AssertKind::EndCRLF.holds(input, 1));
        assert!(AssertKind::StartCRLF.holds(input, 3));
        assert!(AssertKind::WordAscii.holds(b"ab c", 2));
        assert!(AssertKind::WordAscii.holds(b"ab", 0));
        assert!(AssertKind::WordAsciiNegate.holds(b"ab", 1));
        assert!(AssertKind::WordAsciiNegate.holds(b"", 0));
    }

    #[test]
    fn test_start_offsets() {
        let automaton = parse("ab");
        assert_eq!(automaton.match_at(b"xab", 1).and_then(|t| t.span()), Some(Span::new(1, 3)));
        assert_eq!(automaton.match_at(b"xab", 0), None);
        assert_eq!(automaton.match_at(b"ab", 3), None);
        assert_eq!(parse("^ab").match_at(b"xab", 1), None);
        assert_eq!(parse("").match_at(b"ab", 2).and_then(|t| t.span()), Some(Span::new(2, 2)));
    }

    // -- Sessions ---------------------------------------------------------

    #[test]
    fn test_no_explicit_groups() {
        let table = parse("a+b").find_first(b"xaab").unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.span(), Some(Span::new(1, 4)));
        assert_eq!(table.get(1), None);
    }

    #[test]
    fn test_sessions_are_repeatable_and_clonable() {
        let automaton = parse("(a|b)*(c)");
        let input = b"abacbc";
        let mut session = Session::new(&automaton, input);
        let first = session.try_match(0);
        let mut copy = session.clone();
        assert_eq!(session.try_match(0), first);
        assert_eq!(copy.try_match(0), first);
        assert_eq!(first.map(|t| spans(&t)), Some(vec![Some((0, 4)), Some((2, 3)), Some((3, 4))]));
        assert_eq!(session.try_match(input.len() + 1), None);
    }

    #[test]
    fn test_sessions_share_one_automaton_across_threads() {
        let automaton = parse("(a|ab)(c|bcd)(d*)");
        let inputs: [&[u8]; 4] = [b"abcd", b"abc", b"xabcdd", b"ab"];
        let expected: Vec<_> = inputs.iter().map(|input| automaton.find_first(input)).collect();
        let shared = &automaton;
        std::thread::scope(|scope| {
            let handles: Vec<_> = inputs
                .iter()
                .map(|&input| scope.spawn(move || find_first(shared, input)))
                .collect();
            for (handle, expected) in handles.into_iter().zip(&expected) {
                assert_eq!(&handle.join().unwrap(), expected);
            }
        });
    }

    #[test]
    fn test_cancellation() {
        let automaton = parse("a+");
        let flag = Arc::new(AtomicBool::new(false));
        let mut session = Session::new(&automaton, b"aaa").with_cancellation(flag.clone());
        assert_eq!(session.try_match(0).and_then(|t| t.span()), Some(Span::new(0, 3)));
        flag.store(true, Ordering::Relaxed);
        assert_eq!(session.try_match(0), None);

        // Nothing is consumed, so there is nothing to interrupt.
        let empty = parse("");
        let mut session = Session::new(&empty, b"aaa").with_cancellation(flag);
        assert_eq!(session.try_match(0).and_then(|t| t.span()), Some(Span::new(0, 0)));
    }

    #[test]
    fn test_named_groups() {
        let automaton = parse(r"(?P<year>\d{4})-(?P<month>\d{2})");
        assert_eq!(automaton.capture_len(), 3);
        assert_eq!(automaton.capture_index("year"), Some(1));
        assert_eq!(automaton.capture_index("month"), Some(2));
        assert_eq!(automaton.capture_index("day"), None);
        let table = automaton.find_first(b"on 2024-05").unwrap();
        assert_eq!(table.get(1).map(Span::range), Some(3..7));
        assert_eq!(table.get(2).map(Span::range), Some(8..10));
    }

    // -- Builder configuration -------------------------------------------

    #[test]
    fn test_unsupported_syntax() {
        assert!(matches!(
            RegexBuilder::new().parse(r"(?u:\w)"),
            Err(Error::UnsupportedClass(_))
        ));
        assert!(matches!(
            RegexBuilder::new().parse(r"(?u:\b)"),
            Err(Error::UnsupportedLook(_))
        ));
        assert!(matches!(RegexBuilder::new().parse("(a"), Err(Error::Syntax(_))));
    }

    #[test]
    fn test_to_dot() {
        let mut dot = Vec::new();
        parse("(a|bc)+d").to_dot(&mut dot).unwrap();
        let dot = String::from_utf8(dot).unwrap();
        assert!(dot.starts_with("digraph automaton {"));
        assert!(dot.contains("alt-1"));
        assert!(dot.contains("cap 1"));
        assert!(dot.contains("[shape=octagon]"));
        assert!(dot.contains("[peripheries=2]"));
        assert!(dot.trim_end().ends_with('}'));
    }

    #[test]
    fn test_memory_size_grows_with_pattern() {
        let small = parse("a");
        let large = parse("(a|b)+cde{2,4}(?:fg|h)*");
        assert!(small.memory_size() > std::mem::size_of::<Automaton>());
        assert!(large.memory_size() > small.memory_size());
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn test_validation_accepts_builder_output() {
        for pattern in ["", "a", "(a|b)*c", "^(?:ab|a){2}b?$", r"\bx+\B", "((a)|b)+"] {
            let automaton = parse(pattern);
            let states = automaton.states().to_vec();
            let classes = automaton.classes().to_vec();
            let names = vec![None; automaton.capture_len()];
            assert!(Automaton::new(states, classes, names).is_ok(), "{:?}", pattern);
        }
    }

    #[test]
    fn test_validation_errors() {
        let s = StateIdx::new;

        let mut parts = manual_alternation();
        parts.0[2].min = 2;
        assert_eq!(
            load(parts).unwrap_err(),
            Error::InvalidBounds { state: s(2), min: 2, max: 1 }
        );

        let mut parts = manual_alternation();
        parts.0[3].next = s(42);
        assert_eq!(
            load(parts).unwrap_err(),
            Error::DanglingState { state: s(3), target: s(42) }
        );

        let mut parts = manual_alternation();
        parts.0[4].owner = s(2);
        assert_eq!(
            load(parts).unwrap_err(),
            Error::OwnerNotAlpha { state: s(4), owner: s(2) }
        );

        let mut parts = manual_alternation();
        parts.0[1].kind = StateKind::Alpha {
            branches: vec![s(2), s(3)].into_boxed_slice(),
            close: s(4),
        };
        assert_eq!(load(parts).unwrap_err(), Error::BadClose { alpha: s(1), close: s(4) });

        let mut parts = manual_alternation();
        parts.0[1].kind = StateKind::Alpha {
            branches: Box::default(),
            close: s(5),
        };
        assert_eq!(load(parts).unwrap_err(), Error::NoBranches(s(1)));

        let mut parts = manual_alternation();
        parts.0[1].owner = s(1);
        assert_eq!(load(parts).unwrap_err(), Error::OwnerCycle(s(1)));

        let mut parts = manual_alternation();
        parts.0[1].capture = Some(0);
        assert_eq!(load(parts).unwrap_err(), Error::BadCapture { state: s(1), capture: 0 });

        let mut parts = manual_alternation();
        parts.0[6].kind = StateKind::Ordinary { class: None, look: None };
        assert_eq!(load(parts).unwrap_err(), Error::MissingClass(s(6)));

        let mut parts = manual_alternation();
        parts.0[6].kind = StateKind::Ordinary { class: None, look: None };
        parts.0[6].min = 0;
        parts.0[6].max = 0;
        parts.0[6].next = s(6);
        assert_eq!(load(parts).unwrap_err(), Error::ZeroWidthLoop(s(6)));

        let mut parts = manual_alternation();
        parts.0[6].kind = StateKind::Ordinary { class: Some(ClassIdx::new(7)), look: None };
        assert_eq!(load(parts).unwrap_err(), Error::DanglingClass { state: s(6), class: 7 });

        let mut parts = manual_alternation();
        parts.0.pop();
        assert_eq!(load(parts).unwrap_err(), Error::MissingSentinels);
    }

    #[test]
    fn test_error_messages() {
        let err = Error::InvalidBounds {
            state: StateIdx::new(2),
            min: 2,
            max: 1,
        };
        assert_eq!(err.to_string(), "state 2 has bounds {2,1}");
        assert_eq!(
            Error::OwnerCycle(StateIdx::new(5)).to_string(),
            "the owners of state 5 do not lead back to the root"
        );
    }

    // -- Cross-checks against the regex crate ----------------------------

    #[test]
    fn test_exhaustive_against_regex_crate() {
        let inputs = all_inputs(b"abcd", 4);
        let patterns = [
            "a{2,3}b",
            "(ab)+",
            "(a|ab)c",
            "(a|ab)(c|bcd)(d*)",
            "^a$",
            "(a|b)*c",
            "a?b",
            "(ab|a)(bc|c)",
            "^(a|ab)+$",
            "(a+)(a)",
            "a*ab",
            "(?:a|b){2,3}c",
            "^(?:ab|a){2}b?$",
            "c$",
            "(b)?c",
            "((a)|b)+",
            "(a{1,2}){2}",
            "(?:^)?b",
            "ab(^)*",
            "(^)*b+(ab)*",
            "(c|(?:^){0,3})b",
            "ab(b|ab)((?:^)?){2}",
            "(a?){1,2}",
            "(a{0,2}){2,3}b",
            "((ab|(){0,3}))*",
            "(a*)*",
            "(a?){3}",
            "(?:(a)|(b)|(cd))+",
            "a[bc]+d?",
            "(a(b(c)?)*)d",
            "",
        ];
        for pattern in patterns {
            assert_matches_regex_crate(&mut RegexBuilder::new(), "", pattern, &inputs);
        }
    }

    #[test]
    fn test_word_boundaries_against_regex_crate() {
        let inputs = all_inputs(b"ab ", 5);
        for pattern in [r"\bab\b", r"\Ba", r"b\b", r"(\ba+)+"] {
            assert_matches_regex_crate(&mut RegexBuilder::new(), "", pattern, &inputs);
        }
    }

    #[test]
    fn test_line_modes_against_regex_crate() {
        let inputs = all_inputs(b"ab\n", 4);
        for pattern in ["^b$", "^(a|b)+$", "a.b"] {
            assert_matches_regex_crate(RegexBuilder::new().multi_line(true), "m", pattern, &inputs);
        }
        let mut dot_all = RegexBuilder::new();
        dot_all.dot_matches_new_line(true);
        assert_matches_regex_crate(&mut dot_all, "s", "a.b", &inputs);

        let inputs = all_inputs(b"b\r\n", 4);
        for pattern in ["^b$", "^$"] {
            let mut builder = RegexBuilder::new();
            builder.multi_line(true).crlf(true);
            assert_matches_regex_crate(&mut builder, "Rm", pattern, &inputs);
        }
    }

    #[test]
    fn test_case_insensitive_against_regex_crate() {
        let inputs = all_inputs(b"aAbB", 4);
        for pattern in ["AB+", "(a|b)B"] {
            let mut builder = RegexBuilder::new();
            builder.case_insensitive(true);
            assert_matches_regex_crate(&mut builder, "i", pattern, &inputs);
        }
    }
}
