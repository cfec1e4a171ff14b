//! Thought-outline state core.
//!
//! A tree of thoughts is stored as two indexes: a lexeme index (value -> every
//! context the value appears in) and a context index (context -> its children).
//! Every operation takes a committed `State` snapshot and returns a new one; the
//! move/merge engine keeps both indexes consistent while relocating subtrees.

pub mod core {
    use chrono::{DateTime, Utc};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use uuid::Uuid;

    /* ------------------------------ Constants ------------------------------ */

    /// Sentinel context value for top-level thoughts.
    pub const ROOT_TOKEN: &str = "__ROOT__";
    /// Context holding application metadata such as settings.
    pub const EM_TOKEN: &str = "__EM__";
    /// Meta child whose subtree holds archived thoughts.
    pub const ARCHIVE_TOKEN: &str = "=archive";
    /// Meta child that marks its parent as not movable by editing shortcuts.
    pub const IMMOVABLE_TOKEN: &str = "=immovable";

    /// Settings seeded under `__EM__` when a freshly loaded outline has none.
    pub const INITIAL_SETTINGS: &str = "\
- Settings
  - Theme
    - Dark
  - Font Size
    - 18
  - Tutorial
    - On
";

    pub type Timestamp = DateTime<Utc>;

    pub fn timestamp() -> Timestamp {
        Utc::now()
    }

    /// The epoch; marks records that were never edited by a user.
    pub fn never() -> Timestamp {
        Timestamp::default()
    }

    /* ------------------------------- IDs ------------------------------- */

    /// Stable identity of a thought that survives renames and moves.
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
    )]
    #[serde(transparent)]
    pub struct ThoughtId(pub Uuid);

    impl ThoughtId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }

        /// Records loaded from older snapshots may carry no id at all.
        pub fn is_nil(&self) -> bool {
            self.0.is_nil()
        }
    }

    /// Lookup key of a value in the lexeme index.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ThoughtKey(pub String);

    /// Lookup key of a context in the context index.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ContextKey(pub String);

    impl fmt::Display for ThoughtKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl fmt::Display for ContextKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    /// Ancestor values from the root sentinel down to (excluding) a thought.
    pub type Context = Vec<String>;

    /// Ranked ancestors from the root down to (including) a thought.
    pub type Path = Vec<Child>;

    /// Per-context display toggle ("show the contexts of this thought").
    pub type ContextViews = IndexMap<ContextKey, bool>;

    /// One child entry of a parent record; also used as a path segment.
    #[serde_with::skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Child {
        pub value: String,
        /// Ordering key among siblings; not necessarily contiguous.
        pub rank: f64,
        #[serde(default)]
        pub id: ThoughtId,
        #[serde(default = "never")]
        pub last_updated: Timestamp,
        pub archived: Option<Timestamp>,
    }

    impl Child {
        /// A bare path segment; identity and timestamps are filled in by the store.
        pub fn new(value: impl Into<String>, rank: f64) -> Self {
            Self {
                value: value.into(),
                rank,
                id: ThoughtId::default(),
                last_updated: never(),
                archived: None,
            }
        }

        pub fn with_id(mut self, id: ThoughtId) -> Self {
            self.id = id;
            self
        }
    }

    /* ------------------------------ Records ------------------------------ */

    /// One occurrence of a lexeme: the context it appears in and its rank there.
    #[serde_with::skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ThoughtContext {
        pub context: Context,
        pub rank: f64,
        #[serde(default)]
        pub id: ThoughtId,
        pub archived: Option<Timestamp>,
    }

    /// Every occurrence of one textual value across the outline.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Lexeme {
        pub value: String,
        #[serde(default)]
        pub contexts: Vec<ThoughtContext>,
        pub created: Timestamp,
        pub last_updated: Timestamp,
    }

    impl Lexeme {
        pub fn new(value: impl Into<String>, now: Timestamp) -> Self {
            Self {
                value: value.into(),
                contexts: vec![],
                created: now,
                last_updated: now,
            }
        }

        /// The occurrence matching both context and rank exactly.
        pub fn occurrence(&self, context: &[String], rank: f64) -> Option<&ThoughtContext> {
            self.contexts
                .iter()
                .find(|o| o.context == context && o.rank == rank)
        }

        /// The first occurrence in `context`, whatever its rank.
        pub fn occurrence_in(&self, context: &[String]) -> Option<&ThoughtContext> {
            self.contexts.iter().find(|o| o.context == context)
        }
    }

    /// Children set of one context. Never stored empty: empty contexts are absent.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Parent {
        pub context: Context,
        pub children: Vec<Child>,
        pub last_updated: Timestamp,
        /// The children of this context are only partially loaded.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        pub pending: bool,
    }

    /// A move whose descendant index update waits for lazily loaded data.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PendingMove {
        pub path_old: Path,
        pub path_new: Path,
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum ThoughtError {
        #[error("import failed at line {line}: {message}")]
        Import { line: usize, message: String },
        #[error("no thought found at {0:?}")]
        NotFound(Vec<String>),
        #[error("thought {0:?} is marked =immovable")]
        Immovable(String),
    }
}

pub mod hash {
    //! Deterministic lookup keys. Pure functions, no state.

    use crate::core::{ContextKey, ThoughtKey};

    pub fn hash_thought(value: &str) -> ThoughtKey {
        ThoughtKey(blake3::hash(value.as_bytes()).to_hex().to_string())
    }

    /// Segments are length-prefixed so `["a/b"]` and `["a", "b"]` never collide.
    pub fn hash_context<S: AsRef<str>>(context: &[S]) -> ContextKey {
        let mut hasher = blake3::Hasher::new();
        for value in context {
            let bytes = value.as_ref().as_bytes();
            hasher.update(&(bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        }
        ContextKey(hasher.finalize().to_hex().to_string())
    }

}

pub mod path {
    //! Conversions between ranked paths and value contexts, plus path algebra.

    use crate::core::*;
    use crate::hash::hash_context;
    use crate::store::{ThoughtIndices, get_children};

    pub fn path_to_context(path: &[Child]) -> Context {
        path.iter().map(|c| c.value.clone()).collect()
    }

    pub fn head<T>(xs: &[T]) -> Option<&T> {
        xs.last()
    }

    pub fn head_rank(path: &[Child]) -> Option<f64> {
        path.last().map(|c| c.rank)
    }

    pub fn head_id(path: &[Child]) -> Option<ThoughtId> {
        path.last().map(|c| c.id).filter(|id| !id.is_nil())
    }

    pub fn parent_of<T>(xs: &[T]) -> &[T] {
        &xs[..xs.len().saturating_sub(1)]
    }

    /// Parent context, falling back to the root sentinel for top-level thoughts.
    pub fn rooted_parent_of(context: &[String]) -> Context {
        if context.len() > 1 {
            parent_of(context).to_vec()
        } else {
            vec![ROOT_TOKEN.to_string()]
        }
    }

    /// Context that the children of `path` live in.
    pub fn context_of(path: &[Child]) -> Context {
        if path.is_empty() {
            vec![ROOT_TOKEN.to_string()]
        } else {
            path_to_context(path)
        }
    }

    pub fn is_root(context: &[String]) -> bool {
        context.is_empty() || (context.len() == 1 && context[0] == ROOT_TOKEN)
    }

    /// Strips the leading root sentinel, if any.
    pub fn unroot(context: &[String]) -> &[String] {
        match context.first() {
            Some(first) if first == ROOT_TOKEN => &context[1..],
            _ => context,
        }
    }

    pub fn equal_thought_ranked(a: &Child, b: &Child) -> bool {
        a.value == b.value && a.rank == b.rank
    }

    pub fn equal_thought_value(value: &str) -> impl Fn(&Child) -> bool + '_ {
        move |child| child.value == value
    }

    /// Whether `subset` is an ancestor-or-equal prefix of `superset`.
    pub fn subset_thoughts(superset: &[Child], subset: &[Child]) -> bool {
        subset.len() <= superset.len()
            && superset
                .iter()
                .zip(subset)
                .all(|(a, b)| equal_thought_ranked(a, b))
    }

    /// Resolves a value context to a ranked path, taking the first matching child
    /// at each level.
    pub fn rank_thoughts_first_match(indices: &ThoughtIndices, context: &[String]) -> Option<Path> {
        let mut path = Path::with_capacity(context.len());
        for value in unroot(context) {
            let children = get_children(indices, &context_of(&path));
            let child = children.into_iter().find(|c| &c.value == value)?;
            path.push(child);
        }
        Some(path)
    }

    /// Collapses a path that passes through contextual views into the plain path
    /// of the thought it points at.
    ///
    /// When the context ending at segment `i` is shown as a contextual view, segment
    /// `i + 1` names one of the contexts the value of segment `i` appears in, so the
    /// pair is replaced by the ranked path of that context plus the viewed thought.
    pub fn simplify_path(indices: &ThoughtIndices, views: &ContextViews, path: &[Child]) -> Path {
        let mut simple = Path::with_capacity(path.len());
        let mut i = 0;
        while i < path.len() {
            simple.push(path[i].clone());
            let viewed = views
                .get(&hash_context(&path_to_context(&simple)))
                .copied()
                .unwrap_or(false);
            if viewed && i + 1 < path.len() {
                match resolve_context_view(indices, &path[i], &path[i + 1]) {
                    Some(resolved) => {
                        simple = resolved;
                        i += 2;
                        continue;
                    }
                    None => tracing::warn!(
                        value = %path[i].value,
                        through = %path[i + 1].value,
                        "contextual view does not resolve; keeping path segment"
                    ),
                }
            }
            i += 1;
        }
        simple
    }

    fn resolve_context_view(indices: &ThoughtIndices, viewed: &Child, through: &Child) -> Option<Path> {
        let lexeme = indices.lexeme(&viewed.value)?;
        let occurrence = lexeme
            .contexts
            .iter()
            .find(|o| o.context.last() == Some(&through.value))?;
        let mut resolved = rank_thoughts_first_match(indices, &occurrence.context)?;
        resolved.push(Child {
            rank: occurrence.rank,
            id: occurrence.id,
            ..viewed.clone()
        });
        Some(resolved)
    }

}

pub mod store {
    //! Dual index store: the lexeme index and the context index, and the
    //! top-level `State` snapshot that owns them.
    //!
    //! Records are held behind `Arc`, so cloning a snapshot shares every record
    //! that a mutation does not touch. Selectors take the indexes explicitly.

    use crate::core::*;
    use crate::hash::{hash_context, hash_thought};
    use crate::recently_edited::RecentlyEdited;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ThoughtIndices {
        #[serde(default)]
        pub context_index: IndexMap<ContextKey, Arc<Parent>>,
        #[serde(default)]
        pub thought_index: IndexMap<ThoughtKey, Arc<Lexeme>>,
    }

    impl ThoughtIndices {
        pub fn lexeme(&self, value: &str) -> Option<&Lexeme> {
            self.thought_index.get(&hash_thought(value)).map(Arc::as_ref)
        }

        pub fn parent(&self, context: &[String]) -> Option<&Parent> {
            self.context_index.get(&hash_context(context)).map(Arc::as_ref)
        }
    }

    /// Committed application snapshot. Mutations produce a new value.
    #[derive(Debug, Clone, PartialEq, Default)]
    pub struct State {
        pub thoughts: ThoughtIndices,
        /// Focused path, or `None` when nothing is selected.
        pub cursor: Option<Path>,
        /// Caret position within the focused thought.
        pub cursor_offset: Option<usize>,
        /// Drop the cursor on the next render.
        pub clear_cursor_on_render: bool,
        pub context_views: ContextViews,
        pub recently_edited: RecentlyEdited,
        /// Moves whose descendant updates are waiting on lazily loaded data.
        pub pending_moves: Vec<PendingMove>,
        /// Bumped on every render so views know to redraw.
        pub data_nonce: u64,
    }

    impl State {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_recently_edited(mut self, recently_edited: RecentlyEdited) -> Self {
            self.recently_edited = recently_edited;
            self
        }
    }

    /* ------------------------------ Selectors ------------------------------ */

    pub fn get_thought<'a>(indices: &'a ThoughtIndices, value: &str) -> Option<&'a Lexeme> {
        indices.lexeme(value)
    }

    pub fn get_parent<'a>(indices: &'a ThoughtIndices, context: &[String]) -> Option<&'a Parent> {
        indices.parent(context)
    }

    /// Children exactly as stored, including entries whose lexeme is missing.
    pub fn get_all_children(indices: &ThoughtIndices, context: &[String]) -> Vec<Child> {
        indices
            .parent(context)
            .map(|p| p.children.clone())
            .unwrap_or_default()
    }

    /// Children whose lexeme exists. A missing lexeme is an integrity gap, so the
    /// entry is skipped rather than treated as an error.
    pub fn get_children(indices: &ThoughtIndices, context: &[String]) -> Vec<Child> {
        get_all_children(indices, context)
            .into_iter()
            .filter(|child| {
                let found = indices.lexeme(&child.value).is_some();
                if !found {
                    tracing::warn!(value = %child.value, ?context, "child has no lexeme; skipping");
                }
                found
            })
            .collect()
    }

    pub fn get_children_ranked(indices: &ThoughtIndices, context: &[String]) -> Vec<Child> {
        let mut children = get_children(indices, context);
        sort_by_rank(&mut children);
        children
    }

    /// Children sorted by value, case-insensitively.
    pub fn get_thoughts_sorted(indices: &ThoughtIndices, context: &[String]) -> Vec<Child> {
        let mut children = get_children(indices, context);
        children.sort_by(|a, b| {
            a.value
                .to_lowercase()
                .cmp(&b.value.to_lowercase())
                .then_with(|| a.value.cmp(&b.value))
        });
        children
    }

    /// One past the highest rank in `context`, or 0 when it has no children.
    pub fn get_next_rank(indices: &ThoughtIndices, context: &[String]) -> f64 {
        get_all_children(indices, context)
            .iter()
            .map(|c| c.rank)
            .reduce(f64::max)
            .map_or(0.0, |max| max + 1.0)
    }

    /// One below the lowest rank in `context`, or 0 when it has no children.
    pub fn get_prev_rank(indices: &ThoughtIndices, context: &[String]) -> f64 {
        get_all_children(indices, context)
            .iter()
            .map(|c| c.rank)
            .reduce(f64::min)
            .map_or(0.0, |min| min - 1.0)
    }

    pub fn is_pending(indices: &ThoughtIndices, context: &[String]) -> bool {
        indices.parent(context).is_some_and(|p| p.pending)
    }

    pub fn has_child(indices: &ThoughtIndices, context: &[String], value: &str) -> bool {
        indices
            .parent(context)
            .is_some_and(|p| p.children.iter().any(|c| c.value == value))
    }

    /// The thought whose children live in `context` carries `=immovable`.
    pub fn is_immovable(indices: &ThoughtIndices, context: &[String]) -> bool {
        has_child(indices, context, IMMOVABLE_TOKEN)
    }

    pub fn sort_by_rank(children: &mut [Child]) {
        children.sort_by(|a, b| a.rank.total_cmp(&b.rank));
    }

    /* --------------------------- Lexeme occurrences --------------------------- */

    pub fn add_context(
        lexeme: &Lexeme,
        context: &[String],
        rank: f64,
        id: ThoughtId,
        archived: Option<Timestamp>,
        now: Timestamp,
    ) -> Lexeme {
        let mut contexts = lexeme.contexts.clone();
        contexts.push(ThoughtContext {
            context: context.to_vec(),
            rank,
            id,
            archived,
        });
        Lexeme {
            contexts,
            last_updated: now,
            ..lexeme.clone()
        }
    }

    pub fn remove_context(lexeme: &Lexeme, context: &[String], rank: f64, now: Timestamp) -> Lexeme {
        Lexeme {
            contexts: lexeme
                .contexts
                .iter()
                .filter(|o| !(o.context == context && o.rank == rank))
                .cloned()
                .collect(),
            last_updated: now,
            ..lexeme.clone()
        }
    }

    /// Replaces the occurrence at (`old_context`, `old_rank`) with one at
    /// (`new_context`, `new_rank`), keeping its position in the list.
    ///
    /// The old occurrence is located by context and rank, then by context alone
    /// when the rank is stale. If another occurrence already sits in
    /// `new_context`, that one survives and the old occurrence is only removed.
    #[allow(clippy::too_many_arguments)]
    pub fn move_occurrence(
        lexeme: &Lexeme,
        old_context: &[String],
        new_context: &[String],
        old_rank: f64,
        new_rank: f64,
        id: ThoughtId,
        archived: Option<Timestamp>,
        now: Timestamp,
    ) -> Lexeme {
        let mut contexts = lexeme.contexts.clone();
        let old_pos = contexts
            .iter()
            .position(|o| o.context == old_context && o.rank == old_rank)
            .or_else(|| contexts.iter().position(|o| o.context == old_context));
        let merged = contexts
            .iter()
            .enumerate()
            .any(|(i, o)| Some(i) != old_pos && o.context == new_context);
        let occurrence = ThoughtContext {
            context: new_context.to_vec(),
            rank: new_rank,
            id,
            archived,
        };
        match old_pos {
            Some(pos) if merged => {
                contexts.remove(pos);
            }
            Some(pos) => contexts[pos] = occurrence,
            None if merged => {}
            None => contexts.push(occurrence),
        }
        Lexeme {
            contexts,
            last_updated: now,
            ..lexeme.clone()
        }
    }

    /// Collapses repeated occurrences in `context`, keeping the first.
    pub fn remove_duplicated_context(mut lexeme: Lexeme, context: &[String]) -> Lexeme {
        let mut seen = false;
        lexeme.contexts.retain(|o| {
            if o.context != context {
                return true;
            }
            let keep = !seen;
            seen = true;
            keep
        });
        lexeme
    }

}

pub mod updates {
    //! Update orchestrator: applies batched index deltas to a snapshot.

    use crate::core::*;
    use crate::hash::{hash_context, hash_thought};
    use crate::recently_edited::RecentlyEdited;
    use crate::store::{State, ThoughtIndices, add_context};
    use indexmap::IndexMap;
    use std::sync::Arc;

    /// A batch of index deltas. `None` deletes the record under that key.
    #[derive(Debug, Clone, Default)]
    pub struct ThoughtUpdates {
        pub context_index_updates: IndexMap<ContextKey, Option<Parent>>,
        pub thought_index_updates: IndexMap<ThoughtKey, Option<Lexeme>>,
        pub recently_edited: Option<RecentlyEdited>,
        pub pending_moves: Vec<PendingMove>,
    }

    pub type Reducer = Box<dyn FnOnce(State) -> State>;

    /// Threads a snapshot through a sequence of transitions.
    pub fn reducer_flow(state: State, reducers: impl IntoIterator<Item = Reducer>) -> State {
        reducers.into_iter().fold(state, |state, reducer| reducer(state))
    }

    /// Builds a parent record, or `None` when there are no children left.
    pub fn parent_or_none(
        context: Context,
        children: Vec<Child>,
        now: Timestamp,
        pending: bool,
    ) -> Option<Parent> {
        (!children.is_empty()).then(|| Parent {
            context,
            children,
            last_updated: now,
            pending,
        })
    }

    /// Merges a batch into the snapshot. Empty records are pruned on the way in.
    pub fn update_thoughts(mut state: State, updates: ThoughtUpdates) -> State {
        let ThoughtUpdates {
            context_index_updates,
            thought_index_updates,
            recently_edited,
            pending_moves,
        } = updates;

        apply_to_indices(&mut state.thoughts, context_index_updates, thought_index_updates);
        if let Some(recently_edited) = recently_edited {
            state.recently_edited = recently_edited;
        }
        state.pending_moves.extend(pending_moves);
        state
    }

    fn apply_to_indices(
        indices: &mut ThoughtIndices,
        context_index_updates: IndexMap<ContextKey, Option<Parent>>,
        thought_index_updates: IndexMap<ThoughtKey, Option<Lexeme>>,
    ) {
        for (key, parent) in context_index_updates {
            match parent.filter(|p| !p.children.is_empty()) {
                Some(parent) => {
                    indices.context_index.insert(key, Arc::new(parent));
                }
                None => {
                    indices.context_index.shift_remove(&key);
                }
            }
        }
        for (key, lexeme) in thought_index_updates {
            match lexeme.filter(|l| !l.contexts.is_empty()) {
                Some(lexeme) => {
                    indices.thought_index.insert(key, Arc::new(lexeme));
                }
                None => {
                    indices.thought_index.shift_remove(&key);
                }
            }
        }
    }

    /// Marks the snapshot for redraw and honors a deferred cursor clear.
    pub fn render(mut state: State) -> State {
        state.data_nonce += 1;
        if state.clear_cursor_on_render {
            state.cursor = None;
            state.cursor_offset = None;
            state.clear_cursor_on_render = false;
        }
        state
    }

    /// Adds `value` under `context` in a working copy of the indexes, or returns
    /// the existing child when the context already holds that value.
    pub(crate) fn insert_child(
        indices: &mut ThoughtIndices,
        context: &[String],
        value: &str,
        rank: f64,
        now: Timestamp,
    ) -> Child {
        let context_key = hash_context(context);
        if let Some(existing) = indices
            .context_index
            .get(&context_key)
            .and_then(|p| p.children.iter().find(|c| c.value == value))
        {
            return existing.clone();
        }

        let child = Child {
            value: value.to_string(),
            rank,
            id: ThoughtId::new(),
            last_updated: now,
            archived: None,
        };
        match indices.context_index.get_mut(&context_key) {
            Some(parent) => {
                let parent = Arc::make_mut(parent);
                parent.children.push(child.clone());
                parent.last_updated = now;
            }
            None => {
                indices.context_index.insert(
                    context_key,
                    Arc::new(Parent {
                        context: context.to_vec(),
                        children: vec![child.clone()],
                        last_updated: now,
                        pending: false,
                    }),
                );
            }
        }

        let thought_key = hash_thought(value);
        let lexeme = indices
            .thought_index
            .get(&thought_key)
            .map(|l| l.as_ref().clone())
            .unwrap_or_else(|| Lexeme::new(value, now));
        let lexeme = add_context(&lexeme, context, rank, child.id, None, now);
        indices.thought_index.insert(thought_key, Arc::new(lexeme));
        child
    }

    /// Creates a thought under `context` (or finds the existing one with that value).
    pub fn create_thought(
        state: &State,
        context: &[String],
        value: &str,
        rank: f64,
        now: Timestamp,
    ) -> (State, Child) {
        let mut next = state.clone();
        let child = insert_child(&mut next.thoughts, context, value, rank, now);
        (render(next), child)
    }

}

pub mod recently_edited {
    //! Best-effort tracker of recently edited paths, mirrored as a tree keyed by
    //! thought values. Only the most specific edit along a branch is a leaf.

    use crate::core::*;
    use crate::path::path_to_context;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};

    pub const DEFAULT_MAX_DEPTH: usize = 64;
    pub const DEFAULT_LIMIT: usize = 100;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum RecentlyEditedError {
        #[error("cannot track an empty path")]
        EmptyPath,
        #[error("path depth {depth} exceeds tracker limit {limit}")]
        DepthExceeded { depth: usize, limit: usize },
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct EditLeaf {
        pub path: Path,
        pub last_updated: Timestamp,
    }

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    pub struct EditNode {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub leaf: Option<EditLeaf>,
        #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
        pub children: IndexMap<String, EditNode>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct RecentlyEdited {
        #[serde(default)]
        root: EditNode,
        #[serde(skip, default = "default_max_depth")]
        max_depth: usize,
    }

    fn default_max_depth() -> usize {
        DEFAULT_MAX_DEPTH
    }

    impl Default for RecentlyEdited {
        fn default() -> Self {
            Self {
                root: EditNode::default(),
                max_depth: DEFAULT_MAX_DEPTH,
            }
        }
    }

    impl RecentlyEdited {
        pub fn with_max_depth(mut self, max_depth: usize) -> Self {
            self.max_depth = max_depth;
            self
        }

        pub fn max_depth(&self) -> usize {
            self.max_depth
        }

        pub fn is_empty(&self) -> bool {
            self.root.leaf.is_none() && self.root.children.is_empty()
        }

        pub fn get(&self, values: &[String]) -> Option<&EditNode> {
            values
                .iter()
                .try_fold(&self.root, |node, value| node.children.get(value))
        }

        fn validate(&self, path: &[Child]) -> Result<(), RecentlyEditedError> {
            if path.is_empty() {
                return Err(RecentlyEditedError::EmptyPath);
            }
            if path.len() > self.max_depth {
                return Err(RecentlyEditedError::DepthExceeded {
                    depth: path.len(),
                    limit: self.max_depth,
                });
            }
            Ok(())
        }

        /// Records an edit at `path`. Ancestors stop being leaves.
        pub fn touch(&self, path: &[Child], now: Timestamp) -> Result<Self, RecentlyEditedError> {
            self.validate(path)?;
            let mut next = self.clone();
            let mut node = &mut next.root;
            for child in path {
                node.leaf = None;
                node = node.children.entry(child.value.clone()).or_default();
            }
            node.leaf = Some(EditLeaf {
                path: path.to_vec(),
                last_updated: now,
            });
            Ok(next)
        }

        /// Relocates the subtree at `old_path` to `new_path`, rewriting the leaf paths
        /// inside it. Merges into an existing node at the destination. When nothing
        /// was tracked at `old_path`, the move counts as an edit at `new_path`.
        pub fn tree_move(
            &self,
            old_path: &[Child],
            new_path: &[Child],
            now: Timestamp,
        ) -> Result<Self, RecentlyEditedError> {
            self.validate(old_path)?;
            self.validate(new_path)?;
            let mut next = self.clone();
            let Some(mut moved) = next.detach(&path_to_context(old_path)) else {
                return next.touch(new_path, now);
            };
            rebase_leaves(&mut moved, old_path.len(), new_path);
            if let Some(leaf) = moved.leaf.as_mut() {
                leaf.last_updated = now;
            }
            next.attach(new_path, moved);
            Ok(next)
        }

        pub fn tree_delete(&self, path: &[Child]) -> Result<Self, RecentlyEditedError> {
            self.validate(path)?;
            let mut next = self.clone();
            next.detach(&path_to_context(path));
            Ok(next)
        }

        /// Leaves, most recent first.
        pub fn leaves_by_recency(&self, limit: usize) -> Vec<&EditLeaf> {
            let mut leaves = Vec::new();
            let mut stack = vec![&self.root];
            while let Some(node) = stack.pop() {
                if let Some(leaf) = &node.leaf {
                    leaves.push(leaf);
                }
                stack.extend(node.children.values());
            }
            leaves.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
            leaves.truncate(limit);
            leaves
        }

        /// Removes the node at `values` and prunes ancestors left empty.
        fn detach(&mut self, values: &[String]) -> Option<EditNode> {
            fn rec(node: &mut EditNode, values: &[String]) -> Option<EditNode> {
                let (first, rest) = values.split_first()?;
                if rest.is_empty() {
                    return node.children.shift_remove(first);
                }
                let child = node.children.get_mut(first)?;
                let removed = rec(child, rest);
                if child.leaf.is_none() && child.children.is_empty() {
                    node.children.shift_remove(first);
                }
                removed
            }
            rec(&mut self.root, values)
        }

        fn attach(&mut self, path: &[Child], subtree: EditNode) {
            let Some((last, ancestors)) = path.split_last() else {
                return;
            };
            let mut node = &mut self.root;
            for child in ancestors {
                node.leaf = None;
                node = node.children.entry(child.value.clone()).or_default();
            }
            node.leaf = None;
            match node.children.get_mut(&last.value) {
                Some(existing) => merge_nodes(existing, subtree),
                None => {
                    node.children.insert(last.value.clone(), subtree);
                }
            }
        }
    }

    fn rebase_leaves(node: &mut EditNode, old_len: usize, new_path: &[Child]) {
        let mut stack = vec![node];
        while let Some(node) = stack.pop() {
            if let Some(leaf) = node.leaf.as_mut() {
                let tail = leaf.path.get(old_len..).unwrap_or_default();
                leaf.path = new_path.iter().chain(tail).cloned().collect();
            }
            stack.extend(node.children.values_mut());
        }
    }

    /// Newer leaf wins; children merge recursively.
    fn merge_nodes(into: &mut EditNode, from: EditNode) {
        let EditNode { leaf, children } = from;
        into.leaf = match (into.leaf.take(), leaf) {
            (Some(a), Some(b)) => Some(if b.last_updated >= a.last_updated { b } else { a }),
            (a, b) => a.or(b),
        };
        for (value, child) in children {
            match into.children.get_mut(&value) {
                Some(existing) => merge_nodes(existing, child),
                None => {
                    into.children.insert(value, child);
                }
            }
        }
    }

}

pub mod cursor {
    //! Cursor tracker: keeps the focused path pointing at the same thought when an
    //! ancestor of it moves.

    use crate::core::*;
    use crate::path::{parent_of, subset_thoughts};
    use crate::store::State;
    use indexmap::IndexMap;

    /// Inputs for re-rooting a cursor under a moved thought.
    #[derive(Debug, Clone, Copy)]
    pub struct CursorRewrite<'a> {
        pub old_path: &'a [Child],
        pub new_path: &'a [Child],
        /// Surviving destination sibling after a duplicate merge.
        pub merged_head: Option<&'a Child>,
        /// New ranks of descendants, keyed by their values below the move root.
        pub descendant_ranks: &'a IndexMap<Context, f64>,
    }

    pub fn is_cursor_affected(cursor: &[Child], old_path: &[Child]) -> bool {
        subset_thoughts(cursor, old_path)
    }

    /// The cursor re-rooted at the new path, or `None` when the move does not
    /// touch it. The tail below the move root keeps its values and ids.
    pub fn rewrite_cursor(cursor: &[Child], rewrite: &CursorRewrite<'_>) -> Option<Path> {
        if !is_cursor_affected(cursor, rewrite.old_path) {
            return None;
        }
        let mut rewritten: Path = match rewrite.merged_head {
            Some(head) => parent_of(rewrite.new_path)
                .iter()
                .chain(std::iter::once(head))
                .cloned()
                .collect(),
            None => rewrite.new_path.to_vec(),
        };
        let mut relative = Context::new();
        for child in &cursor[rewrite.old_path.len()..] {
            relative.push(child.value.clone());
            let rank = rewrite
                .descendant_ranks
                .get(&relative)
                .copied()
                .unwrap_or(child.rank);
            rewritten.push(Child {
                rank,
                ..child.clone()
            });
        }
        Some(rewritten)
    }

    /// Focuses `path`; an empty path means nothing is selected.
    pub fn set_cursor(state: &State, path: Option<Path>, offset: Option<usize>) -> State {
        let path = path.filter(|p| !p.is_empty());
        State {
            cursor_offset: if path.is_some() { offset } else { None },
            cursor: path,
            ..state.clone()
        }
    }

    /// Navigates home: nothing selected.
    pub fn home(state: &State) -> State {
        State {
            clear_cursor_on_render: false,
            ..set_cursor(state, None, None)
        }
    }

    /// Asks the next render to drop the cursor.
    pub fn defer_cursor_clear(state: &State) -> State {
        State {
            clear_cursor_on_render: true,
            ..state.clone()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::path::path_to_context;
        use crate::test_support::ctx;
        use crate::updates::render;

        fn p(values: &[(&str, f64)]) -> Path {
            values.iter().map(|(v, r)| Child::new(*v, *r)).collect()
        }

        #[test]
        fn unaffected_cursor_is_left_alone() {
            let ranks = IndexMap::new();
            let rewrite = CursorRewrite {
                old_path: &p(&[("a", 0.0), ("b", 0.0)]),
                new_path: &p(&[("c", 0.0), ("b", 0.0)]),
                merged_head: None,
                descendant_ranks: &ranks,
            };
            assert_eq!(rewrite_cursor(&p(&[("a", 0.0), ("z", 1.0)]), &rewrite), None);
        }

        #[test]
        fn cursor_below_moved_thought_keeps_tail() {
            let ranks = IndexMap::new();
            let old_path = p(&[("a", 0.0), ("b", 0.0)]);
            let new_path = p(&[("c", 1.0), ("b", 3.0)]);
            let rewrite = CursorRewrite {
                old_path: &old_path,
                new_path: &new_path,
                merged_head: None,
                descendant_ranks: &ranks,
            };
            let cursor = p(&[("a", 0.0), ("b", 0.0), ("x", 2.0), ("y", 0.0)]);
            let rewritten = rewrite_cursor(&cursor, &rewrite).unwrap();
            assert_eq!(path_to_context(&rewritten), ctx(&["c", "b", "x", "y"]));
            assert_eq!(rewritten[1].rank, 3.0);
            assert_eq!(rewritten[2].rank, 2.0);
        }

        #[test]
        fn merged_head_and_descendant_ranks_are_substituted() {
            let mut ranks = IndexMap::new();
            ranks.insert(ctx(&["x"]), 9.0);
            let old_path = p(&[("a", 0.0), ("b", 0.0)]);
            let new_path = p(&[("c", 1.0), ("b", 3.0)]);
            let survivor = Child::new("b", 0.5);
            let rewrite = CursorRewrite {
                old_path: &old_path,
                new_path: &new_path,
                merged_head: Some(&survivor),
                descendant_ranks: &ranks,
            };
            let cursor = p(&[("a", 0.0), ("b", 0.0), ("x", 2.0)]);
            let rewritten = rewrite_cursor(&cursor, &rewrite).unwrap();
            assert_eq!(rewritten[1].rank, 0.5);
            assert_eq!(rewritten[2].rank, 9.0);
        }

        #[test]
        fn home_and_deferred_clear() {
            let state = set_cursor(&State::new(), Some(p(&[("a", 0.0)])), Some(3));
            assert_eq!(state.cursor_offset, Some(3));
            assert!(home(&state).cursor.is_none());

            let deferred = defer_cursor_clear(&state);
            assert!(deferred.cursor.is_some());
            assert!(render(deferred).cursor.is_none());

            assert!(set_cursor(&state, Some(vec![]), Some(1)).cursor.is_none());
        }
    }
}

pub mod moves {
    //! Move/merge engine.
    //!
    //! Relocates a thought and its whole subtree from one context to another:
    //! - the moved thought's lexeme occurrence is rewritten, its old parent loses
    //!   the child and its new parent gains it;
    //! - when the destination already holds a child with the same value (and the
    //!   move is not a reorder) the two subtrees merge under the existing child,
    //!   which keeps its rank;
    //! - every descendant is visited with an explicit worklist, its lexeme moved to
    //!   the new context and its parent records folded into one update batch;
    //! - the cursor, contextual views and recently-edited tracker follow along.
    //!
    //! Integrity faults degrade to a logged no-op or a synthesized record, never a
    //! panic, so the dual index stays consistent even over partial data.

    use crate::core::*;
    use crate::cursor::{CursorRewrite, rewrite_cursor};
    use crate::hash::{hash_context, hash_thought};
    use crate::path::*;
    use crate::store::*;
    use crate::updates::{Reducer, ThoughtUpdates, insert_child, parent_or_none, reducer_flow, render, update_thoughts};
    use indexmap::IndexMap;

    /// One visited descendant, ready to be folded into the context index batch.
    #[derive(Debug, Clone)]
    struct DescendantMove {
        old_context: Context,
        new_context: Context,
        /// Entry as it will appear in `new_context`.
        child: Child,
        /// The descendant's own children are only partially loaded.
        pending: bool,
        path_old: Path,
        path_new: Path,
    }

    /// Worklist item: one level of children to relocate.
    #[derive(Debug)]
    struct Frame {
        /// Context whose children are listed, in the pre-move snapshot.
        old_context: Context,
        /// Context those children land in.
        new_context: Context,
        /// Values below the move root leading to this level.
        relative: Context,
        path_old: Path,
        path_new: Path,
    }

    /// Moves the thought at `old_path` to `new_path`, stamping records with the
    /// current time.
    pub fn existing_thought_move(
        state: &State,
        old_path: &[Child],
        new_path: &[Child],
        offset: Option<usize>,
    ) -> State {
        existing_thought_move_at(state, old_path, new_path, offset, timestamp())
    }

    pub fn existing_thought_move_at(
        state: &State,
        old_path: &[Child],
        new_path: &[Child],
        offset: Option<usize>,
        now: Timestamp,
    ) -> State {
        let indices = &state.thoughts;
        let old_simple = simplify_path(indices, &state.context_views, old_path);
        let new_simple = simplify_path(indices, &state.context_views, new_path);
        let (Some(old_head), Some(new_head)) = (old_simple.last(), new_simple.last()) else {
            tracing::error!(?old_path, ?new_path, "cannot move an empty path");
            return state.clone();
        };

        let value = old_head.value.as_str();
        let old_thoughts = path_to_context(&old_simple);
        let new_thoughts = path_to_context(&new_simple);
        let old_rank = old_head.rank;
        let new_rank = new_head.rank;
        let old_context = rooted_parent_of(&old_thoughts);
        let new_context = rooted_parent_of(&new_thoughts);
        let same_context = old_context == new_context;

        let Some(old_lexeme) = indices.lexeme(value) else {
            tracing::error!(?old_path, value, "lexeme not found; move skipped");
            return state.clone();
        };

        let is_archive = new_thoughts.iter().any(|v| v == ARCHIVE_TOKEN);
        let exact = old_lexeme.occurrence(&old_context, old_rank);
        let fresh_archive = is_archive || exact.is_none();
        let archived = if fresh_archive {
            Some(now)
        } else {
            exact.and_then(|o| o.archived)
        };
        let id = head_id(&old_simple)
            .or_else(|| exact.map(|o| o.id).filter(|id| !id.is_nil()))
            .unwrap_or_else(ThoughtId::new);

        let duplicate = get_children_ranked(indices, &new_context)
            .into_iter()
            .find(equal_thought_value(value));
        let duplicate_merge = duplicate.is_some() && !same_context;
        let root_rank = match &duplicate {
            Some(dup) if duplicate_merge => dup.rank,
            _ => new_rank,
        };

        let moved_lexeme = remove_duplicated_context(
            move_occurrence(old_lexeme, &old_context, &new_context, old_rank, root_rank, id, archived, now),
            &new_context,
        );
        // The surviving occurrence decides the entry in the new parent.
        let root_child = survivor_entry(&moved_lexeme, &new_context, value, root_rank, id, archived, now);

        let mut working: IndexMap<ThoughtKey, Lexeme> = IndexMap::new();
        working.insert(hash_thought(value), moved_lexeme);

        /* ------------------------- Moved thought's parents ------------------------- */

        let mut context_updates: IndexMap<ContextKey, Option<Parent>> = IndexMap::new();
        let old_key = hash_context(&old_context);
        let new_key = hash_context(&new_context);
        let old_children: Vec<Child> = get_all_children(indices, &old_context)
            .into_iter()
            .filter(|c| c.value != value)
            .collect();
        context_updates.insert(
            old_key.clone(),
            parent_or_none(old_context.clone(), old_children, now, is_pending(indices, &old_context)),
        );
        let mut new_children = get_all_children(indices, &new_context);
        upsert_child(&mut new_children, root_child.clone());
        context_updates.insert(
            new_key.clone(),
            parent_or_none(new_context.clone(), new_children, now, is_pending(indices, &new_context)),
        );

        /* ------------------------------- Descendants ------------------------------- */

        let (descendants, descendant_ranks) = visit_descendants(
            state,
            &mut working,
            Frame {
                old_context: old_thoughts.clone(),
                new_context: new_thoughts.clone(),
                relative: Context::new(),
                path_old: old_simple.clone(),
                path_new: parent_of(&new_simple)
                    .iter()
                    .cloned()
                    .chain(std::iter::once(root_child.clone()))
                    .collect(),
            },
            same_context,
            fresh_archive,
            now,
        );

        let mut pending_moves = Vec::new();
        if !same_context {
            for result in &descendants {
                fold_descendant(indices, &mut context_updates, &mut pending_moves, result, now);
            }
        }

        let thought_index_updates: IndexMap<ThoughtKey, Option<Lexeme>> =
            working.into_iter().map(|(k, l)| (k, Some(l))).collect();

        /* ------------------------------ Side channels ------------------------------ */

        let rewrite = CursorRewrite {
            old_path,
            new_path,
            merged_head: duplicate_merge.then_some(&root_child),
            descendant_ranks: &descendant_ranks,
        };
        let cursor = state
            .cursor
            .as_ref()
            .map(|cursor| rewrite_cursor(cursor, &rewrite).unwrap_or_else(|| cursor.clone()));

        let mut context_views = state.context_views.clone();
        let old_view = state.context_views.get(&old_key).copied();
        if state.context_views.get(&new_key).copied() != old_view {
            match old_view {
                Some(view) => {
                    context_views.insert(new_key.clone(), view);
                }
                None => {
                    context_views.shift_remove(&new_key);
                }
            }
            context_views.shift_remove(&old_key);
        }

        let recently_edited = match state.recently_edited.tree_move(old_path, new_path, now) {
            Ok(tree) => Some(tree),
            Err(err) => {
                tracing::warn!(error = %err, "recently edited tracker not updated");
                None
            }
        };

        tracing::debug!(
            value,
            ?old_context,
            ?new_context,
            duplicate_merge,
            descendants = descendants.len(),
            pending = pending_moves.len(),
            "moved thought"
        );

        let updates = ThoughtUpdates {
            context_index_updates: context_updates,
            thought_index_updates,
            recently_edited,
            pending_moves,
        };
        let reducers: Vec<Reducer> = vec![
            Box::new(move |s: State| State {
                context_views,
                cursor,
                cursor_offset: offset.or(s.cursor_offset),
                ..s
            }),
            Box::new(move |s| update_thoughts(s, updates)),
            Box::new(render),
        ];
        reducer_flow(state.clone(), reducers)
    }

    /// Visits every descendant of the move root, moving each lexeme occurrence in
    /// `working`. Returns the visited descendants in depth-first order and their
    /// new ranks keyed by value path relative to the root.
    fn visit_descendants(
        state: &State,
        working: &mut IndexMap<ThoughtKey, Lexeme>,
        root: Frame,
        same_context: bool,
        fresh_archive: bool,
        now: Timestamp,
    ) -> (Vec<DescendantMove>, IndexMap<Context, f64>) {
        let indices = &state.thoughts;
        let mut results = Vec::new();
        let mut ranks = IndexMap::new();
        let mut stack = vec![root];

        while let Some(frame) = stack.pop() {
            let mut children = get_all_children(indices, &frame.old_context);
            sort_by_rank(&mut children);
            let reassign = !same_context && !get_all_children(indices, &frame.new_context).is_empty();
            let next_rank = get_next_rank(indices, &frame.new_context);
            let mut next_frames = Vec::with_capacity(children.len());

            for (i, child) in children.into_iter().enumerate() {
                let key = hash_thought(&child.value);
                let moved_rank = if reassign { next_rank + i as f64 } else { child.rank };

                let current = match working.get(&key) {
                    Some(lexeme) => lexeme.clone(),
                    None => match indices.thought_index.get(&key) {
                        Some(lexeme) => lexeme.as_ref().clone(),
                        None => {
                            tracing::warn!(
                                value = %child.value,
                                context = ?frame.old_context,
                                "missing lexeme; synthesizing"
                            );
                            Lexeme::new(child.value.clone(), now)
                        }
                    },
                };
                let archived = if fresh_archive {
                    Some(now)
                } else {
                    current
                        .occurrence(&frame.old_context, child.rank)
                        .map_or(child.archived, |o| o.archived)
                };
                let moved = remove_duplicated_context(
                    move_occurrence(
                        &current,
                        &frame.old_context,
                        &frame.new_context,
                        child.rank,
                        moved_rank,
                        child.id,
                        archived,
                        now,
                    ),
                    &frame.new_context,
                );
                let entry = survivor_entry(&moved, &frame.new_context, &child.value, moved_rank, child.id, archived, now);
                working.insert(key, moved);

                let mut relative = frame.relative.clone();
                relative.push(child.value.clone());
                ranks.insert(relative.clone(), entry.rank);

                let mut child_old_context = frame.old_context.clone();
                child_old_context.push(child.value.clone());
                let mut child_new_context = frame.new_context.clone();
                child_new_context.push(child.value.clone());
                let mut path_old = frame.path_old.clone();
                path_old.push(child.clone());
                let mut path_new = frame.path_new.clone();
                path_new.push(entry.clone());

                results.push(DescendantMove {
                    old_context: frame.old_context.clone(),
                    new_context: frame.new_context.clone(),
                    child: entry,
                    pending: is_pending(indices, &child_old_context),
                    path_old: path_old.clone(),
                    path_new: path_new.clone(),
                });
                next_frames.push(Frame {
                    old_context: child_old_context,
                    new_context: child_new_context,
                    relative,
                    path_old,
                    path_new,
                });
            }
            // Reverse so the first child is visited next.
            stack.extend(next_frames.into_iter().rev());
        }
        (results, ranks)
    }

    /// Folds one descendant into the context index batch. Records already in the
    /// batch take precedence over the snapshot; an explicit deletion reads as empty.
    fn fold_descendant(
        indices: &ThoughtIndices,
        updates: &mut IndexMap<ContextKey, Option<Parent>>,
        pending_moves: &mut Vec<PendingMove>,
        result: &DescendantMove,
        now: Timestamp,
    ) {
        let batched_children = |updates: &IndexMap<ContextKey, Option<Parent>>, context: &[String]| {
            match updates.get(&hash_context(context)) {
                Some(Some(parent)) => (parent.children.clone(), parent.pending),
                Some(None) => (Vec::new(), false),
                None => (get_all_children(indices, context), is_pending(indices, context)),
            }
        };

        let (mut children_old, pending_old) = batched_children(updates, &result.old_context);
        children_old.retain(|c| c.value != result.child.value);
        updates.insert(
            hash_context(&result.old_context),
            parent_or_none(
                result.old_context.clone(),
                children_old,
                now,
                pending_old || result.pending,
            ),
        );

        let (mut children_new, pending_new) = batched_children(updates, &result.new_context);
        upsert_child(&mut children_new, result.child.clone());
        updates.insert(
            hash_context(&result.new_context),
            parent_or_none(
                result.new_context.clone(),
                children_new,
                now,
                pending_new || result.pending,
            ),
        );

        if result.pending {
            pending_moves.push(PendingMove {
                path_old: result.path_old.clone(),
                path_new: result.path_new.clone(),
            });
        }
    }

    /// Entry for `value` in `context`, taken from the lexeme's surviving occurrence
    /// there so both indexes agree on rank and id.
    fn survivor_entry(
        lexeme: &Lexeme,
        context: &[String],
        value: &str,
        rank: f64,
        id: ThoughtId,
        archived: Option<Timestamp>,
        now: Timestamp,
    ) -> Child {
        let (rank, id, archived) = lexeme
            .occurrence_in(context)
            .map_or((rank, id, archived), |o| (o.rank, o.id, o.archived));
        Child {
            value: value.to_string(),
            rank,
            id,
            last_updated: now,
            archived,
        }
    }

    /// Replaces the child with the same value in place, or appends.
    fn upsert_child(children: &mut Vec<Child>, child: Child) {
        match children.iter_mut().find(|c| c.value == child.value) {
            Some(existing) => *existing = child,
            None => children.push(child),
        }
    }

    /* --------------------------------- Archive --------------------------------- */

    pub fn archive_thought(state: &State, path: &[Child]) -> State {
        archive_thought_at(state, path, timestamp())
    }

    /// Moves the thought at `path` under the `=archive` child of its context,
    /// creating that meta child first when needed. Thoughts already inside an
    /// archive are left alone.
    pub fn archive_thought_at(state: &State, path: &[Child], now: Timestamp) -> State {
        let simple = simplify_path(&state.thoughts, &state.context_views, path);
        let Some(thought) = simple.last() else {
            tracing::error!(?path, "cannot archive an empty path");
            return state.clone();
        };
        let thoughts = path_to_context(&simple);
        if thoughts.iter().any(|v| v == ARCHIVE_TOKEN) {
            tracing::debug!(?thoughts, "already archived");
            return state.clone();
        }

        let context = rooted_parent_of(&thoughts);
        let mut next = state.clone();
        let rank = get_prev_rank(&next.thoughts, &context);
        let archive = insert_child(&mut next.thoughts, &context, ARCHIVE_TOKEN, rank, now);

        let mut new_path: Path = parent_of(&simple).to_vec();
        new_path.push(archive);
        let rank = get_prev_rank(&next.thoughts, &path_to_context(&new_path));
        new_path.push(Child {
            rank,
            ..thought.clone()
        });
        existing_thought_move_at(&next, &simple, &new_path, None, now)
    }

    /// Moves the thought at value context `from` to the end of the children of
    /// `to_parent`. Within the same parent the rank is kept.
    pub fn move_context(state: &State, from: &[String], to_parent: &[String]) -> Result<State, ThoughtError> {
        move_context_at(state, from, to_parent, timestamp())
    }

    pub fn move_context_at(
        state: &State,
        from: &[String],
        to_parent: &[String],
        now: Timestamp,
    ) -> Result<State, ThoughtError> {
        let old_path = rank_thoughts_first_match(&state.thoughts, from)
            .ok_or_else(|| ThoughtError::NotFound(from.to_vec()))?;
        let Some(head) = old_path.last() else {
            return Err(ThoughtError::NotFound(from.to_vec()));
        };
        let mut new_path = rank_thoughts_first_match(&state.thoughts, to_parent)
            .ok_or_else(|| ThoughtError::NotFound(to_parent.to_vec()))?;
        let destination = context_of(&new_path);
        let rank = if rooted_parent_of(&path_to_context(&old_path)) == destination {
            head.rank
        } else {
            get_next_rank(&state.thoughts, &destination)
        };
        new_path.push(Child {
            rank,
            ..head.clone()
        });
        Ok(existing_thought_move_at(state, &old_path, &new_path, None, now))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::export::export_context;
        use crate::recently_edited::RecentlyEdited;
        use crate::test_support::{assert_consistent, capture_logs, ctx, outline, path};
        use chrono::Duration;
        use std::sync::Arc;

        /// `moved` re-parented under `parent`, at the next free rank there.
        fn destination(state: &State, parent: &[&str], moved: &Child) -> Path {
            let mut dest = if parent.is_empty() { vec![] } else { path(state, parent) };
            let rank = get_next_rank(&state.thoughts, &context_of(&dest));
            dest.push(Child {
                rank,
                ..moved.clone()
            });
            dest
        }

        fn values_ranked(state: &State, context: &[&str]) -> Vec<(String, f64)> {
            get_children_ranked(&state.thoughts, &ctx(context))
                .into_iter()
                .map(|c| (c.value, c.rank))
                .collect()
        }

        /// Indexes with every timestamp reset, for comparisons that ignore time.
        fn untimed(indices: &ThoughtIndices) -> ThoughtIndices {
            let mut indices = indices.clone();
            for parent in indices.context_index.values_mut() {
                let parent = Arc::make_mut(parent);
                parent.last_updated = never();
                for child in &mut parent.children {
                    child.last_updated = never();
                }
            }
            for lexeme in indices.thought_index.values_mut() {
                Arc::make_mut(lexeme).last_updated = never();
            }
            indices
        }

        fn later() -> Timestamp {
            never() + Duration::hours(1)
        }

        #[test]
        fn indent_moves_thought_under_previous_sibling() {
            let state = outline("- a\n  - b\n    - c\n    - d\n");
            let old_path = path(&state, &["a", "b", "d"]);
            let new_path = destination(&state, &["a", "b", "c"], &old_path[2]);

            let next = existing_thought_move_at(&state, &old_path, &new_path, None, later());

            assert_eq!(
                export_context(&next.thoughts, &ctx(&[ROOT_TOKEN])),
                "- __ROOT__\n  - a\n    - b\n      - c\n        - d"
            );
            assert_eq!(values_ranked(&next, &["a", "b"]), [("c".to_string(), 0.0)]);
            let d = next.thoughts.lexeme("d").unwrap();
            assert_eq!(d.contexts.len(), 1);
            assert_eq!(d.contexts[0].context, ctx(&["a", "b", "c"]));
            assert_eq!(d.contexts[0].id, old_path[2].id);
            assert_consistent(&next);
        }

        #[test]
        fn immovable_thought_still_moves_when_invoked_directly() {
            let state = outline("- a\n  - b\n    - c\n    - d\n      - =immovable\n");
            let old_path = path(&state, &["a", "b", "d"]);
            assert!(is_immovable(&state.thoughts, &path_to_context(&old_path)));

            let new_path = destination(&state, &["a", "b", "c"], &old_path[2]);
            let next = existing_thought_move_at(&state, &old_path, &new_path, None, later());

            assert!(is_immovable(&next.thoughts, &ctx(&["a", "b", "c", "d"])));
            assert!(next.thoughts.parent(&ctx(&["a", "b", "d"])).is_none());
            assert_consistent(&next);
        }

        #[test]
        fn duplicate_merge_adopts_existing_rank_and_merges_subtrees() {
            let state = outline(
                "- a\n  - x\n    - 1\n      - p\n    - 2\n- b\n  - y\n  - x\n    - 3\n    - 1\n      - deep\n",
            );
            let old_path = path(&state, &["a", "x"]);
            let new_path = destination(&state, &["b"], &old_path[1]);
            assert_eq!(new_path[1].rank, 2.0);

            let next = existing_thought_move_at(&state, &old_path, &new_path, None, later());

            assert_eq!(
                values_ranked(&next, &["b"]),
                [("y".to_string(), 0.0), ("x".to_string(), 1.0)]
            );
            assert_eq!(
                values_ranked(&next, &["b", "x"]),
                [("3".to_string(), 0.0), ("1".to_string(), 1.0), ("2".to_string(), 3.0)]
            );
            assert_eq!(
                values_ranked(&next, &["b", "x", "1"]),
                [("deep".to_string(), 0.0), ("p".to_string(), 1.0)]
            );
            assert!(next.thoughts.parent(&ctx(&["a"])).is_none());
            assert!(next.thoughts.parent(&ctx(&["a", "x"])).is_none());
            assert_eq!(next.thoughts.lexeme("x").unwrap().contexts.len(), 1);
            assert_eq!(next.thoughts.lexeme("1").unwrap().contexts.len(), 1);
            assert_consistent(&next);
        }

        #[test]
        fn same_context_reorder_preserves_descendant_ranks() {
            let state = outline("- a\n  - b\n    - c\n      - d\n    - f\n  - e\n");
            let old_path = path(&state, &["a", "b"]);
            let mut new_path = old_path.clone();
            new_path[1].rank = 5.0;

            let next = existing_thought_move_at(&state, &old_path, &new_path, None, later());

            assert_eq!(
                values_ranked(&next, &["a"]),
                [("e".to_string(), 1.0), ("b".to_string(), 5.0)]
            );
            assert_eq!(values_ranked(&next, &["a", "b"]), values_ranked(&state, &["a", "b"]));
            assert_eq!(
                values_ranked(&next, &["a", "b", "c"]),
                values_ranked(&state, &["a", "b", "c"])
            );
            assert_eq!(next.thoughts.lexeme("b").unwrap().contexts[0].rank, 5.0);
            assert!(next.pending_moves.is_empty());
            assert_consistent(&next);
        }

        #[test]
        fn moving_a_path_onto_itself_changes_only_timestamps() {
            let state = outline("- a\n  - b\n    - c\n  - e\n- z\n  - c\n");
            let old_path = path(&state, &["a", "b"]);

            let next = existing_thought_move_at(&state, &old_path, &old_path, None, later());

            assert_eq!(untimed(&next.thoughts), untimed(&state.thoughts));
            assert_ne!(next.thoughts, state.thoughts);
        }

        #[test]
        fn missing_root_lexeme_is_a_logged_noop() {
            let mut state = outline("- a\n  - b\n- z\n");
            state.thoughts.thought_index.shift_remove(&hash_thought("b"));
            let mut old_path = path(&state, &["a"]);
            old_path.push(Child::new("b", 0.0));
            let new_path = destination(&state, &["z"], &old_path[1]);

            let (next, logs) = capture_logs(|| existing_thought_move_at(&state, &old_path, &new_path, None, later()));

            assert_eq!(next, state);
            assert!(logs.contains("lexeme not found"), "logs: {logs}");
        }

        #[test]
        fn missing_descendant_lexeme_is_synthesized() {
            let mut state = outline("- a\n  - b\n    - c\n- z\n");
            state.thoughts.thought_index.shift_remove(&hash_thought("c"));
            let old_path = path(&state, &["a", "b"]);
            let new_path = destination(&state, &["z"], &old_path[1]);

            let (next, logs) = capture_logs(|| existing_thought_move_at(&state, &old_path, &new_path, None, later()));

            assert!(logs.contains("missing lexeme; synthesizing"), "logs: {logs}");
            let c = next.thoughts.lexeme("c").unwrap();
            assert_eq!(c.contexts.len(), 1);
            assert_eq!(c.contexts[0].context, ctx(&["z", "b"]));
            assert_consistent(&next);
        }

        #[test]
        fn tracker_failure_does_not_abort_the_move() {
            let state = outline("- a\n  - b\n- z\n")
                .with_recently_edited(RecentlyEdited::default().with_max_depth(1));
            let old_path = path(&state, &["a", "b"]);
            let new_path = destination(&state, &["z"], &old_path[1]);

            let (next, logs) = capture_logs(|| existing_thought_move_at(&state, &old_path, &new_path, None, later()));

            assert!(logs.contains("recently edited tracker not updated"), "logs: {logs}");
            assert_eq!(values_ranked(&next, &["z"]), [("b".to_string(), 0.0)]);
            assert_eq!(next.recently_edited, state.recently_edited);
            assert_consistent(&next);
        }

        #[test]
        fn tracker_follows_the_move() {
            let state = outline("- a\n  - b\n- z\n");
            let old_path = path(&state, &["a", "b"]);
            let new_path = destination(&state, &["z"], &old_path[1]);

            let next = existing_thought_move_at(&state, &old_path, &new_path, None, later());

            let leaf = next
                .recently_edited
                .get(&ctx(&["z", "b"]))
                .and_then(|n| n.leaf.as_ref())
                .unwrap();
            assert_eq!(leaf.last_updated, later());
        }

        #[test]
        fn cursor_below_moved_thought_is_rewritten() {
            let mut state = outline("- a\n  - b\n    - c\n- z\n  - q\n");
            state.cursor = Some(path(&state, &["a", "b", "c"]));
            let old_path = path(&state, &["a", "b"]);
            let new_path = destination(&state, &["z"], &old_path[1]);

            let next = existing_thought_move_at(&state, &old_path, &new_path, Some(2), later());

            let cursor = next.cursor.clone().unwrap();
            assert_eq!(path_to_context(&cursor), ctx(&["z", "b", "c"]));
            assert_eq!(cursor[1].rank, 1.0);
            assert_eq!(cursor[2].id, state.cursor.as_ref().unwrap()[2].id);
            assert_eq!(next.cursor_offset, Some(2));
        }

        #[test]
        fn cursor_elsewhere_is_untouched() {
            let mut state = outline("- a\n  - b\n- z\n  - q\n");
            state.cursor = Some(path(&state, &["z", "q"]));
            let old_path = path(&state, &["a", "b"]);
            let new_path = destination(&state, &["z"], &old_path[1]);

            let next = existing_thought_move_at(&state, &old_path, &new_path, None, later());
            assert_eq!(next.cursor, state.cursor);
        }

        #[test]
        fn merged_cursor_takes_surviving_ranks() {
            let mut state = outline("- a\n  - x\n    - 1\n      - p\n- b\n  - y\n  - x\n    - 1\n      - deep\n");
            state.cursor = Some(path(&state, &["a", "x", "1", "p"]));
            let old_path = path(&state, &["a", "x"]);
            let new_path = destination(&state, &["b"], &old_path[1]);

            let next = existing_thought_move_at(&state, &old_path, &new_path, None, later());

            let expected = path(&next, &["b", "x", "1", "p"]);
            let ranks = |p: &[Child]| p.iter().map(|c| (c.value.clone(), c.rank)).collect::<Vec<_>>();
            assert_eq!(ranks(next.cursor.as_deref().unwrap()), ranks(&expected));
            assert_consistent(&next);
        }

        #[test]
        fn context_view_follows_parent_context() {
            let mut state = outline("- a\n  - b\n- z\n");
            state.context_views.insert(hash_context(&ctx(&["a"])), true);
            let old_path = path(&state, &["a", "b"]);
            let new_path = destination(&state, &["z"], &old_path[1]);

            let next = existing_thought_move_at(&state, &old_path, &new_path, None, later());

            assert_eq!(next.context_views.get(&hash_context(&ctx(&["z"]))), Some(&true));
            assert!(!next.context_views.contains_key(&hash_context(&ctx(&["a"]))));
        }

        #[test]
        fn pending_descendant_is_written_and_queued() {
            let mut state = outline("- a\n  - b\n    - c\n      - d\n- z\n");
            let key = hash_context(&ctx(&["a", "b", "c"]));
            if let Some(parent) = state.thoughts.context_index.get_mut(&key) {
                Arc::make_mut(parent).pending = true;
            }
            let old_path = path(&state, &["a", "b"]);
            let new_path = destination(&state, &["z"], &old_path[1]);

            let next = existing_thought_move_at(&state, &old_path, &new_path, None, later());

            assert_eq!(next.pending_moves.len(), 1);
            let pending = &next.pending_moves[0];
            assert_eq!(path_to_context(&pending.path_old), ctx(&["a", "b", "c"]));
            assert_eq!(path_to_context(&pending.path_new), ctx(&["z", "b", "c"]));
            assert!(is_pending(&next.thoughts, &ctx(&["z", "b"])));
            assert_eq!(
                next.thoughts.lexeme("c").unwrap().contexts[0].context,
                ctx(&["z", "b"])
            );
            assert_consistent(&next);
        }

        #[test]
        fn empty_path_is_a_noop() {
            let state = outline("- a\n");
            let (next, logs) = capture_logs(|| existing_thought_move_at(&state, &[], &[], None, later()));
            assert_eq!(next, state);
            assert!(logs.contains("cannot move an empty path"));
        }

        #[test]
        fn archive_moves_under_meta_child_and_stamps_subtree() {
            let state = outline("- a\n  - b\n    - c\n  - d\n");
            let next = archive_thought_at(&state, &path(&state, &["a", "b"]), later());

            assert_eq!(
                values_ranked(&next, &["a"]),
                [("=archive".to_string(), -1.0), ("d".to_string(), 1.0)]
            );
            let b = next.thoughts.lexeme("b").unwrap();
            assert_eq!(b.contexts[0].context, ctx(&["a", ARCHIVE_TOKEN]));
            assert_eq!(b.contexts[0].archived, Some(later()));
            let c = next.thoughts.lexeme("c").unwrap();
            assert_eq!(c.contexts[0].context, ctx(&["a", ARCHIVE_TOKEN, "b"]));
            assert_eq!(c.contexts[0].archived, Some(later()));
            assert_consistent(&next);

            let again = archive_thought_at(&next, &path(&next, &["a", ARCHIVE_TOKEN, "b"]), later());
            assert_eq!(again, next);
        }

        #[test]
        fn archive_reuses_existing_meta_child() {
            let state = outline("- a\n  - =archive\n    - old\n  - b\n");
            let next = archive_thought_at(&state, &path(&state, &["a", "b"]), later());
            assert_eq!(
                values_ranked(&next, &["a", ARCHIVE_TOKEN]),
                [("b".to_string(), -1.0), ("old".to_string(), 0.0)]
            );
            assert_consistent(&next);
        }

        #[test]
        fn move_context_resolves_values() {
            let state = outline("- a\n  - b\n- z\n  - q\n");
            let next = move_context_at(&state, &ctx(&["a", "b"]), &ctx(&["z"]), later()).unwrap();
            assert_eq!(
                values_ranked(&next, &["z"]),
                [("q".to_string(), 0.0), ("b".to_string(), 1.0)]
            );

            let err = move_context_at(&state, &ctx(&["nope"]), &ctx(&["z"]), later()).unwrap_err();
            assert!(matches!(err, ThoughtError::NotFound(_)));
        }
    }
}

pub mod integrity {
    //! Dual index consistency checker.

    use crate::core::*;
    use crate::hash::{hash_context, hash_thought};
    use crate::store::ThoughtIndices;
    use std::collections::HashSet;

    #[derive(Debug, Clone, PartialEq, thiserror::Error)]
    pub enum IntegrityViolation {
        #[error("parent record for {context:?} is stored under the wrong key")]
        KeyMismatch { context: Context },
        #[error("parent record for {context:?} has no children")]
        EmptyParent { context: Context },
        #[error("{value:?} appears more than once in {context:?}")]
        DuplicateChild { context: Context, value: String },
        #[error("child {value:?} of {context:?} has no lexeme")]
        MissingLexeme { context: Context, value: String },
        #[error("lexeme {value:?} has no occurrence in {context:?} at rank {rank}")]
        MissingOccurrence { context: Context, value: String, rank: f64 },
        #[error("lexeme {value:?} is stored under the wrong key")]
        LexemeKeyMismatch { value: String },
        #[error("lexeme {value:?} has no occurrences")]
        EmptyLexeme { value: String },
        #[error("{context:?} has no child {value:?} at rank {rank}")]
        MissingChild { context: Context, value: String, rank: f64 },
    }

    /// Every violation of the bidirectional consistency between the two indexes,
    /// plus records that should have been pruned.
    pub fn check(indices: &ThoughtIndices) -> Vec<IntegrityViolation> {
        let mut violations = Vec::new();

        for (key, parent) in &indices.context_index {
            let context = &parent.context;
            if hash_context(context) != *key {
                violations.push(IntegrityViolation::KeyMismatch {
                    context: context.clone(),
                });
            }
            if parent.children.is_empty() {
                violations.push(IntegrityViolation::EmptyParent {
                    context: context.clone(),
                });
            }
            let mut seen = HashSet::new();
            for child in &parent.children {
                if !seen.insert(child.value.as_str()) {
                    violations.push(IntegrityViolation::DuplicateChild {
                        context: context.clone(),
                        value: child.value.clone(),
                    });
                }
                match indices.lexeme(&child.value) {
                    None => violations.push(IntegrityViolation::MissingLexeme {
                        context: context.clone(),
                        value: child.value.clone(),
                    }),
                    Some(lexeme) if lexeme.occurrence(context, child.rank).is_none() => {
                        violations.push(IntegrityViolation::MissingOccurrence {
                            context: context.clone(),
                            value: child.value.clone(),
                            rank: child.rank,
                        })
                    }
                    Some(_) => {}
                }
            }
        }

        for (key, lexeme) in &indices.thought_index {
            if hash_thought(&lexeme.value) != *key {
                violations.push(IntegrityViolation::LexemeKeyMismatch {
                    value: lexeme.value.clone(),
                });
            }
            if lexeme.contexts.is_empty() {
                violations.push(IntegrityViolation::EmptyLexeme {
                    value: lexeme.value.clone(),
                });
            }
            for occurrence in &lexeme.contexts {
                let found = indices.parent(&occurrence.context).is_some_and(|p| {
                    p.children
                        .iter()
                        .any(|c| c.value == lexeme.value && c.rank == occurrence.rank)
                });
                if !found {
                    violations.push(IntegrityViolation::MissingChild {
                        context: occurrence.context.clone(),
                        value: lexeme.value.clone(),
                        rank: occurrence.rank,
                    });
                }
            }
        }

        violations
    }

}

pub mod import {
    //! Plain-text outline import: one `- value` bullet per line, two spaces of
    //! indentation per level.

    use crate::core::*;
    use crate::path::context_of;
    use crate::store::{State, get_next_rank};
    use crate::updates::{insert_child, render};
    use nom::{
        IResult,
        bytes::complete::tag,
        character::complete::{not_line_ending, space0, space1},
        combinator::eof,
        error::VerboseError,
        sequence::tuple,
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Parsed bullet tree, before it is written to the indexes.
    #[derive(Debug, Clone, PartialEq, Default)]
    pub struct OutlineNode {
        pub value: String,
        pub children: Vec<OutlineNode>,
    }

    /// `<indent>- <value>`; returns the indent width and the trimmed value.
    fn parse_bullet(i: &str) -> PResult<'_, (usize, &str)> {
        let (i, (indent, _, _, value, _)) = tuple((space0, tag("-"), space1, not_line_ending, eof))(i)?;
        Ok((i, (indent.len(), value.trim_end())))
    }

    /// Parses an indented bullet list into a forest. Blank lines are skipped.
    pub fn parse_outline(text: &str) -> Result<Vec<OutlineNode>, ThoughtError> {
        // Stack of (indent, node); a node is attached to its parent when popped.
        let mut stack: Vec<(usize, OutlineNode)> = Vec::new();
        let mut roots = Vec::new();

        fn attach(stack: &mut Vec<(usize, OutlineNode)>, roots: &mut Vec<OutlineNode>, node: OutlineNode) {
            match stack.last_mut() {
                Some((_, parent)) => parent.children.push(node),
                None => roots.push(node),
            }
        }

        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (_, (indent, value)) = parse_bullet(line).map_err(|_| ThoughtError::Import {
                line: n + 1,
                message: format!("expected \"- value\", found {:?}", line.trim_end()),
            })?;
            if value.is_empty() {
                return Err(ThoughtError::Import {
                    line: n + 1,
                    message: "empty thought".to_string(),
                });
            }
            while stack.last().is_some_and(|(depth, _)| *depth >= indent) {
                if let Some((_, done)) = stack.pop() {
                    attach(&mut stack, &mut roots, done);
                }
            }
            stack.push((
                indent,
                OutlineNode {
                    value: value.to_string(),
                    children: vec![],
                },
            ));
        }
        while let Some((_, done)) = stack.pop() {
            attach(&mut stack, &mut roots, done);
        }
        Ok(roots)
    }

    pub fn import_text(state: &State, at: &[Child], text: &str) -> Result<State, ThoughtError> {
        import_text_at(state, at, text, timestamp())
    }

    /// Imports an outline below the thought at `at` (the root when empty). Values
    /// already present in a context are reused, so importing twice is harmless.
    pub fn import_text_at(
        state: &State,
        at: &[Child],
        text: &str,
        now: Timestamp,
    ) -> Result<State, ThoughtError> {
        let forest = parse_outline(text)?;
        let mut next = state.clone();
        let mut work: Vec<(Context, Path, &OutlineNode)> = forest
            .iter()
            .rev()
            .map(|node| (context_of(at), at.to_vec(), node))
            .collect();

        while let Some((context, path, node)) = work.pop() {
            let rank = get_next_rank(&next.thoughts, &context);
            let child = insert_child(&mut next.thoughts, &context, &node.value, rank, now);
            let mut child_path = path;
            child_path.push(child);
            let child_context = context_of(&child_path);
            for grandchild in node.children.iter().rev() {
                work.push((child_context.clone(), child_path.clone(), grandchild));
            }
        }
        Ok(render(next))
    }

}

pub mod export {
    //! Plain-text export in the same bullet format `import` reads.

    use crate::core::*;
    use crate::path::is_root;
    use crate::store::{ThoughtIndices, get_children_ranked};

    /// Renders `context` and everything below it. The first line is the context's
    /// own head (or the root sentinel); no trailing newline.
    pub fn export_context(indices: &ThoughtIndices, context: &[String]) -> String {
        let context: Context = if context.is_empty() {
            vec![ROOT_TOKEN.to_string()]
        } else {
            context.to_vec()
        };
        let head = context.last().map_or(ROOT_TOKEN, String::as_str);
        let mut lines = vec![format!("- {head}")];
        let mut stack = children_of(indices, &context, 1);
        while let Some((child_context, value, depth)) = stack.pop() {
            lines.push(format!("{}- {value}", "  ".repeat(depth)));
            stack.extend(children_of(indices, &child_context, depth + 1));
        }
        lines.join("\n")
    }

    /// Ranked children of `context`, reversed so the first one pops first.
    fn children_of(indices: &ThoughtIndices, context: &[String], depth: usize) -> Vec<(Context, String, usize)> {
        get_children_ranked(indices, context)
            .into_iter()
            .rev()
            .map(|child| {
                let mut child_context = if is_root(context) { Context::new() } else { context.to_vec() };
                child_context.push(child.value.clone());
                (child_context, child.value, depth)
            })
            .collect()
    }

}

pub mod storage {
    //! Persistence seam: snapshot shape, repositories, startup load.

    use crate::core::*;
    use crate::import::import_text_at;
    use crate::path::{is_root, path_to_context};
    use crate::recently_edited::RecentlyEdited;
    use crate::store::{State, ThoughtIndices, get_children};
    use crate::updates::render;
    use anyhow::{Context as _, Result};
    use serde::{Deserialize, Serialize};
    use std::fs;
    use std::path::PathBuf;

    /// What a repository stores: both indexes plus the UI state worth restoring.
    #[serde_with::skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Snapshot {
        #[serde(flatten)]
        pub thoughts: ThoughtIndices,
        pub cursor: Option<Path>,
        #[serde(default)]
        pub context_views: ContextViews,
        #[serde(default)]
        pub recently_edited: RecentlyEdited,
    }

    pub fn snapshot_of(state: &State) -> Snapshot {
        Snapshot {
            thoughts: state.thoughts.clone(),
            cursor: state.cursor.clone(),
            context_views: state.context_views.clone(),
            recently_edited: state.recently_edited.clone(),
        }
    }

    /// Loads and saves whole snapshots. `load` returns `None` when nothing has
    /// been saved yet.
    pub trait ThoughtRepository {
        fn load(&self) -> Result<Option<Snapshot>>;
        fn save(&mut self, snapshot: &Snapshot) -> Result<()>;
    }

    /// Snapshot stored as one JSON document.
    #[derive(Debug, Clone)]
    pub struct JsonFileRepository {
        path: PathBuf,
    }

    impl JsonFileRepository {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        pub fn path(&self) -> &std::path::Path {
            &self.path
        }
    }

    impl ThoughtRepository for JsonFileRepository {
        fn load(&self) -> Result<Option<Snapshot>> {
            if !self.path.exists() {
                return Ok(None);
            }
            let text = fs::read_to_string(&self.path)
                .with_context(|| format!("reading snapshot {}", self.path.display()))?;
            let snapshot = serde_json::from_str(&text)
                .with_context(|| format!("parsing snapshot {}", self.path.display()))?;
            Ok(Some(snapshot))
        }

        fn save(&mut self, snapshot: &Snapshot) -> Result<()> {
            if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
            }
            let json = serde_json::to_string_pretty(snapshot)?;
            fs::write(&self.path, json)
                .with_context(|| format!("writing snapshot {}", self.path.display()))
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct MemoryRepository {
        pub snapshot: Option<Snapshot>,
    }

    impl ThoughtRepository for MemoryRepository {
        fn load(&self) -> Result<Option<Snapshot>> {
            Ok(self.snapshot.clone())
        }

        fn save(&mut self, snapshot: &Snapshot) -> Result<()> {
            self.snapshot = Some(snapshot.clone());
            Ok(())
        }
    }

    /// Startup load. Missing data yields empty indexes; a saved cursor at the root
    /// means nothing is selected. Seeds default settings under `__EM__` when the
    /// outline has none. The tracker depth limit of `state` is kept.
    pub fn load_local_thoughts(state: &State, repo: &dyn ThoughtRepository) -> Result<State> {
        let snapshot = match repo.load().context("loading thoughts")? {
            Some(snapshot) => snapshot,
            None => {
                tracing::info!("no saved thoughts; starting from an empty outline");
                Snapshot::default()
            }
        };
        let cursor = snapshot
            .cursor
            .filter(|c| !is_root(&path_to_context(c)));
        let loaded = State {
            thoughts: snapshot.thoughts,
            cursor,
            cursor_offset: None,
            context_views: snapshot.context_views,
            recently_edited: snapshot
                .recently_edited
                .with_max_depth(state.recently_edited.max_depth()),
            ..state.clone()
        };

        let settings = [EM_TOKEN.to_string(), "Settings".to_string()];
        if get_children(&loaded.thoughts, &settings).is_empty() {
            let seeded = import_text_at(&loaded, &[Child::new(EM_TOKEN, 0.0)], INITIAL_SETTINGS, never())
                .context("seeding default settings")?;
            return Ok(seeded);
        }
        Ok(render(loaded))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::integrity;
        use crate::store::get_children_ranked;
        use crate::test_support::{ctx, outline, path};

        #[test]
        fn empty_repository_seeds_settings() {
            let state = load_local_thoughts(&State::new(), &MemoryRepository::default()).unwrap();
            let settings: Vec<_> = get_children_ranked(&state.thoughts, &ctx(&[EM_TOKEN, "Settings"]))
                .into_iter()
                .map(|c| c.value)
                .collect();
            assert_eq!(settings, ["Theme", "Font Size", "Tutorial"]);
            assert!(state.cursor.is_none());
            assert!(integrity::check(&state.thoughts).is_empty());
        }

        #[test]
        fn existing_settings_are_not_reseeded() {
            let first = load_local_thoughts(&State::new(), &MemoryRepository::default()).unwrap();
            let repo = MemoryRepository {
                snapshot: Some(snapshot_of(&first)),
            };
            let second = load_local_thoughts(&State::new(), &repo).unwrap();
            assert_eq!(first.thoughts, second.thoughts);
        }

        #[test]
        fn json_repository_round_trips_and_restores_cursor() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut repo = JsonFileRepository::new(tmp.path().join("nested/thoughts.json"));
            assert!(repo.load().unwrap().is_none());

            let mut state = outline("- a\n  - b\n");
            state.cursor = Some(path(&state, &["a", "b"]));
            repo.save(&snapshot_of(&state)).unwrap();

            let loaded = load_local_thoughts(&State::new(), &repo).unwrap();
            assert_eq!(loaded.cursor, state.cursor);
            assert_eq!(
                loaded.thoughts.parent(&ctx(&["a"])),
                state.thoughts.parent(&ctx(&["a"]))
            );
        }

        #[test]
        fn root_cursor_is_not_restored() {
            let mut snapshot = snapshot_of(&outline("- a\n"));
            snapshot.cursor = Some(vec![Child::new(ROOT_TOKEN, 0.0)]);
            let repo = MemoryRepository {
                snapshot: Some(snapshot),
            };
            assert!(load_local_thoughts(&State::new(), &repo).unwrap().cursor.is_none());
        }

        #[test]
        fn corrupt_snapshot_is_an_error() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let file = tmp.path().join("thoughts.json");
            fs::write(&file, "{ not json").unwrap();
            let err = load_local_thoughts(&State::new(), &JsonFileRepository::new(&file)).unwrap_err();
            assert!(format!("{err:#}").contains("parsing snapshot"));
        }
    }
}

pub mod config {
    use crate::recently_edited::{DEFAULT_LIMIT, DEFAULT_MAX_DEPTH, RecentlyEdited};
    use crate::store::State;
    use anyhow::{Context, Result};
    use serde::Deserialize;
    use std::fs;
    use std::path::{Path, PathBuf};

    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct CoreConfig {
        #[serde(default)]
        pub recently_edited: RecentlyEditedConfig,
        #[serde(default)]
        pub logging: LoggingConfig,
        #[serde(default)]
        pub storage: StorageConfig,
    }

    impl CoreConfig {
        /// Reads `path`, or falls back to defaults when it does not exist. Relative
        /// paths inside are resolved against the file's directory.
        pub fn load(path: &Path) -> Result<Self> {
            let mut cfg = if path.exists() {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str::<CoreConfig>(&text)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            } else {
                tracing::info!(
                    "No config file found at {}. Using CoreConfig::default().",
                    path.display()
                );
                CoreConfig::default()
            };
            cfg.resolve_paths(path.parent().unwrap_or(Path::new("")));
            Ok(cfg)
        }

        fn resolve_paths(&mut self, root: &Path) {
            self.storage.snapshot_path = absolutize(root, &self.storage.snapshot_path);
        }

        /// Empty state carrying the configured tracker limits.
        pub fn initial_state(&self) -> State {
            State::new().with_recently_edited(RecentlyEdited::default().with_max_depth(self.recently_edited.max_depth))
        }
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct RecentlyEditedConfig {
        #[serde(default = "RecentlyEditedConfig::default_max_depth")]
        pub max_depth: usize,
        #[serde(default = "RecentlyEditedConfig::default_limit")]
        pub limit: usize,
    }

    impl RecentlyEditedConfig {
        fn default_max_depth() -> usize {
            DEFAULT_MAX_DEPTH
        }

        fn default_limit() -> usize {
            DEFAULT_LIMIT
        }
    }

    impl Default for RecentlyEditedConfig {
        fn default() -> Self {
            Self {
                max_depth: Self::default_max_depth(),
                limit: Self::default_limit(),
            }
        }
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct LoggingConfig {
        #[serde(default = "LoggingConfig::default_level")]
        pub level: String,
    }

    impl LoggingConfig {
        fn default_level() -> String {
            "info".to_string()
        }
    }

    impl Default for LoggingConfig {
        fn default() -> Self {
            Self {
                level: Self::default_level(),
            }
        }
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct StorageConfig {
        #[serde(default = "StorageConfig::default_snapshot_path")]
        pub snapshot_path: PathBuf,
    }

    impl StorageConfig {
        fn default_snapshot_path() -> PathBuf {
            PathBuf::from("thoughts.json")
        }
    }

    impl Default for StorageConfig {
        fn default() -> Self {
            Self {
                snapshot_path: Self::default_snapshot_path(),
            }
        }
    }

    fn absolutize(root: &Path, value: &Path) -> PathBuf {
        if value.is_absolute() {
            value.to_path_buf()
        } else {
            root.join(value)
        }
    }

}
