use std::borrow::Cow;
use std::collections::BTreeSet;

use crate::types::{
    fail, ErrorKind, FromBulk, Node, NodeList, NodeValue, RedisError, RedisResult, Resp3Type,
};

/// A borrowed view of one response tree or sub-tree.
///
/// The underlying storage is the flat pre-order node sequence produced by
/// the parser.  Attribute siblings are kept in the sequence but skipped by
/// [`TreeRef::root`] and [`TreeRef::children`]; the raw sequence stays
/// available through [`TreeRef::nodes`].
#[derive(Clone, Copy)]
pub struct TreeRef<'a> {
    nodes: &'a [Node],
    depth: usize,
}

impl<'a> TreeRef<'a> {
    /// Wraps a complete top-level tree.
    pub fn new(nodes: &'a [Node]) -> TreeRef<'a> {
        TreeRef { nodes, depth: 0 }
    }

    /// The raw pre-order node sequence, attributes included.
    pub fn nodes(&self) -> &'a [Node] {
        self.nodes
    }

    /// The root element, skipping any attribute annotations preceding it.
    pub fn root(&self) -> RedisResult<&'a Node> {
        self.root_index()
            .map(|i| &self.nodes[i])
            .ok_or_else(|| RedisError::from((ErrorKind::IncompatibleType, "Empty response tree")))
    }

    /// Iterates the sub-trees one level below the root.  Attribute
    /// annotations and stream sentinels are not yielded.
    pub fn children(&self) -> Children<'a> {
        match self.root_index() {
            Some(i) => Children {
                nodes: self.nodes,
                pos: i + 1,
                end: subtree_end(self.nodes, i),
                depth: self.nodes[i].depth + 1,
            },
            None => Children {
                nodes: self.nodes,
                pos: 0,
                end: 0,
                depth: 0,
            },
        }
    }

    fn root_index(&self) -> Option<usize> {
        let mut i = 0;
        while i < self.nodes.len() {
            let node = &self.nodes[i];
            if node.depth != self.depth {
                return None;
            }
            if node.kind == Resp3Type::Attribute {
                i = subtree_end(self.nodes, i);
                continue;
            }
            return Some(i);
        }
        None
    }
}

fn subtree_end(nodes: &[Node], start: usize) -> usize {
    let depth = nodes[start].depth;
    let mut end = start + 1;
    while end < nodes.len() && nodes[end].depth > depth {
        end += 1;
    }
    end
}

/// Iterator over the child sub-trees of an aggregate.
pub struct Children<'a> {
    nodes: &'a [Node],
    pos: usize,
    end: usize,
    depth: usize,
}

impl<'a> Iterator for Children<'a> {
    type Item = TreeRef<'a>;

    fn next(&mut self) -> Option<TreeRef<'a>> {
        while self.pos < self.end {
            let start = self.pos;
            let node = &self.nodes[start];
            let end = subtree_end(&self.nodes[..self.end], start);
            self.pos = end;
            if node.kind == Resp3Type::Attribute {
                continue;
            }
            if node.kind == Resp3Type::StreamedStringPart
                && node.value.as_blob().is_some_and(|b| b.is_empty())
            {
                continue;
            }
            return Some(TreeRef {
                nodes: &self.nodes[start..end],
                depth: self.depth,
            });
        }
        None
    }
}

// Promotes a server error element into the per-slot error it becomes.
fn check_server_error(tree: &TreeRef<'_>) -> RedisResult<()> {
    let root = tree.root()?;
    if root.kind.is_error() {
        let message =
            String::from_utf8_lossy(root.value.as_blob().unwrap_or_default()).into_owned();
        return Err(RedisError::from_server(root.kind, message));
    }
    Ok(())
}

// The payload bytes of a scalar element.  Streamed strings are
// concatenated, verbatim strings lose their format prefix.
fn scalar_bytes<'a>(tree: &TreeRef<'a>) -> RedisResult<Cow<'a, [u8]>> {
    let root = tree.root()?;
    match (root.kind, &root.value) {
        (Resp3Type::BlobString, NodeValue::Streamed) => {
            let mut out = Vec::new();
            for part in tree.children() {
                if let Some(bytes) = part.root()?.value.as_blob() {
                    out.extend_from_slice(bytes);
                }
            }
            Ok(Cow::Owned(out))
        }
        (Resp3Type::VerbatimString, NodeValue::Blob(payload)) => {
            match payload.iter().position(|&b| b == b':') {
                Some(i) => Ok(Cow::Borrowed(&payload[i + 1..])),
                None => fail!((
                    ErrorKind::IncompatibleType,
                    "Verbatim string without format prefix"
                )),
            }
        }
        (
            Resp3Type::SimpleString
            | Resp3Type::BlobString
            | Resp3Type::Number
            | Resp3Type::Double
            | Resp3Type::Boolean
            | Resp3Type::BigNumber,
            NodeValue::Blob(payload),
        ) => Ok(Cow::Borrowed(&payload[..])),
        _ => fail!((
            ErrorKind::IncompatibleType,
            "Expected a scalar element",
            root.kind.to_string()
        )),
    }
}

// Stores an outcome in a slot and hands a copy of the failure back to the
// caller, so `exec` can report the first failing slot.
fn record<T>(out: &mut Option<RedisResult<T>>, res: RedisResult<T>) -> RedisResult<()> {
    match res {
        Ok(value) => {
            *out = Some(Ok(value));
            Ok(())
        }
        Err(err) => {
            let reported = err.clone_mostly();
            *out = Some(Err(err));
            Err(reported)
        }
    }
}

fn unfilled_error() -> RedisError {
    RedisError::from((ErrorKind::OperationAborted, "Slot was never filled"))
}

/// A destination for one command's reply.
///
/// Implementations dispatch on the tree's root type tag; a mismatch records
/// an error in the slot without affecting any sibling slot.
pub trait Slot {
    /// Populates the slot from a complete response tree.  On failure the
    /// slot keeps the error and an equal error is returned.
    fn fill(&mut self, tree: TreeRef<'_>) -> RedisResult<()>;

    /// Records a failure that happened before a tree could be adapted.
    fn fail(&mut self, err: RedisError);
}

/// Discards whatever the server sends, including error replies.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ignore;

impl Slot for Ignore {
    fn fill(&mut self, _: TreeRef<'_>) -> RedisResult<()> {
        Ok(())
    }

    fn fail(&mut self, _: RedisError) {}
}

/// Adapts a single scalar reply into `T` through [`FromBulk`].
#[derive(Debug)]
pub struct One<T> {
    out: Option<RedisResult<T>>,
}

impl<T> Default for One<T> {
    fn default() -> Self {
        One { out: None }
    }
}

impl<T> One<T> {
    pub fn new() -> One<T> {
        One::default()
    }

    /// The adapted value, if the slot was filled successfully.
    pub fn value(&self) -> Option<&T> {
        match &self.out {
            Some(Ok(value)) => Some(value),
            _ => None,
        }
    }

    /// The slot outcome; unfilled slots report `OperationAborted`.
    pub fn into_result(self) -> RedisResult<T> {
        self.out.unwrap_or_else(|| Err(unfilled_error()))
    }

    /// Borrowed access to the raw outcome.
    pub fn get(&self) -> Option<&RedisResult<T>> {
        self.out.as_ref()
    }
}

impl<T: FromBulk> Slot for One<T> {
    fn fill(&mut self, tree: TreeRef<'_>) -> RedisResult<()> {
        let res = check_server_error(&tree)
            .and_then(|()| scalar_bytes(&tree))
            .and_then(|bytes| T::from_bulk(&bytes));
        record(&mut self.out, res)
    }

    fn fail(&mut self, err: RedisError) {
        self.out = Some(Err(err));
    }
}

/// Wraps any slot, mapping a null reply to "absent" instead of an error.
#[derive(Debug, Default)]
pub struct Opt<S> {
    inner: S,
    out: Option<RedisResult<bool>>,
}

impl<S> Opt<S> {
    pub fn new(inner: S) -> Opt<S> {
        Opt { inner, out: None }
    }

    /// True when the server answered with a null.
    pub fn is_null(&self) -> bool {
        matches!(self.out, Some(Ok(false)))
    }

    /// The inner slot, when a non-null reply was adapted into it.
    pub fn value(&self) -> Option<&S> {
        match self.out {
            Some(Ok(true)) => Some(&self.inner),
            _ => None,
        }
    }

    /// Resolves into the inner slot, `Ok(None)` for a null reply.
    pub fn into_option(self) -> RedisResult<Option<S>> {
        match self.out {
            Some(Ok(true)) => Ok(Some(self.inner)),
            Some(Ok(false)) => Ok(None),
            Some(Err(err)) => Err(err),
            None => Err(unfilled_error()),
        }
    }
}

impl<S: Slot> Slot for Opt<S> {
    fn fill(&mut self, tree: TreeRef<'_>) -> RedisResult<()> {
        match tree.root() {
            Ok(root) if root.kind == Resp3Type::Null => {
                self.out = Some(Ok(false));
                Ok(())
            }
            Ok(_) => match self.inner.fill(tree) {
                Ok(()) => {
                    self.out = Some(Ok(true));
                    Ok(())
                }
                Err(err) => {
                    self.out = Some(Err(err.clone_mostly()));
                    Err(err)
                }
            },
            Err(err) => record(&mut self.out, Err(err)),
        }
    }

    fn fail(&mut self, err: RedisError) {
        self.out = Some(Err(err));
    }
}

/// Adapts an array, set or push reply into `Vec<T>`; every child must be a
/// scalar.
#[derive(Debug)]
pub struct Seq<T> {
    out: Option<RedisResult<Vec<T>>>,
}

impl<T> Default for Seq<T> {
    fn default() -> Self {
        Seq { out: None }
    }
}

impl<T> Seq<T> {
    pub fn new() -> Seq<T> {
        Seq::default()
    }

    pub fn value(&self) -> Option<&Vec<T>> {
        match &self.out {
            Some(Ok(value)) => Some(value),
            _ => None,
        }
    }

    pub fn into_result(self) -> RedisResult<Vec<T>> {
        self.out.unwrap_or_else(|| Err(unfilled_error()))
    }
}

impl<T: FromBulk> Slot for Seq<T> {
    fn fill(&mut self, tree: TreeRef<'_>) -> RedisResult<()> {
        let res = check_server_error(&tree).and_then(|()| {
            let root = tree.root()?;
            if !matches!(
                root.kind,
                Resp3Type::Array | Resp3Type::Set | Resp3Type::Push
            ) {
                fail!((
                    ErrorKind::IncompatibleType,
                    "Expected a sequence-shaped aggregate",
                    root.kind.to_string()
                ));
            }
            tree.children()
                .map(|child| scalar_bytes(&child).and_then(|bytes| T::from_bulk(&bytes)))
                .collect::<RedisResult<Vec<T>>>()
        });
        record(&mut self.out, res)
    }

    fn fail(&mut self, err: RedisError) {
        self.out = Some(Err(err));
    }
}

/// Adapts a map reply into field/value pairs in encounter order.
#[derive(Debug)]
pub struct MapOf<K, V> {
    out: Option<RedisResult<Vec<(K, V)>>>,
}

impl<K, V> Default for MapOf<K, V> {
    fn default() -> Self {
        MapOf { out: None }
    }
}

impl<K, V> MapOf<K, V> {
    pub fn new() -> MapOf<K, V> {
        MapOf::default()
    }

    pub fn value(&self) -> Option<&Vec<(K, V)>> {
        match &self.out {
            Some(Ok(value)) => Some(value),
            _ => None,
        }
    }

    pub fn into_result(self) -> RedisResult<Vec<(K, V)>> {
        self.out.unwrap_or_else(|| Err(unfilled_error()))
    }
}

impl<K: FromBulk, V: FromBulk> Slot for MapOf<K, V> {
    fn fill(&mut self, tree: TreeRef<'_>) -> RedisResult<()> {
        let res = check_server_error(&tree).and_then(|()| {
            let root = tree.root()?;
            if root.kind != Resp3Type::Map {
                fail!((
                    ErrorKind::IncompatibleType,
                    "Expected a map aggregate",
                    root.kind.to_string()
                ));
            }
            let mut pairs = Vec::new();
            let mut children = tree.children();
            while let Some(field) = children.next() {
                let Some(value) = children.next() else {
                    fail!((ErrorKind::UnexpectedSize, "Map with a dangling field"));
                };
                let field = scalar_bytes(&field).and_then(|b| K::from_bulk(&b))?;
                let value = scalar_bytes(&value).and_then(|b| V::from_bulk(&b))?;
                pairs.push((field, value));
            }
            Ok(pairs)
        });
        record(&mut self.out, res)
    }

    fn fail(&mut self, err: RedisError) {
        self.out = Some(Err(err));
    }
}

/// Adapts a set (or array) reply into a `BTreeSet<T>`.
#[derive(Debug)]
pub struct SetOf<T: Ord> {
    out: Option<RedisResult<BTreeSet<T>>>,
}

impl<T: Ord> Default for SetOf<T> {
    fn default() -> Self {
        SetOf { out: None }
    }
}

impl<T: Ord> SetOf<T> {
    pub fn new() -> SetOf<T> {
        SetOf::default()
    }

    pub fn value(&self) -> Option<&BTreeSet<T>> {
        match &self.out {
            Some(Ok(value)) => Some(value),
            _ => None,
        }
    }

    pub fn into_result(self) -> RedisResult<BTreeSet<T>> {
        self.out.unwrap_or_else(|| Err(unfilled_error()))
    }
}

impl<T: FromBulk + Ord> Slot for SetOf<T> {
    fn fill(&mut self, tree: TreeRef<'_>) -> RedisResult<()> {
        let res = check_server_error(&tree).and_then(|()| {
            let root = tree.root()?;
            if !matches!(root.kind, Resp3Type::Set | Resp3Type::Array) {
                fail!((
                    ErrorKind::IncompatibleType,
                    "Expected a set-shaped aggregate",
                    root.kind.to_string()
                ));
            }
            tree.children()
                .map(|child| scalar_bytes(&child).and_then(|bytes| T::from_bulk(&bytes)))
                .collect::<RedisResult<BTreeSet<T>>>()
        });
        record(&mut self.out, res)
    }

    fn fail(&mut self, err: RedisError) {
        self.out = Some(Err(err));
    }
}

/// The universal escape hatch: keeps the flat pre-order node sequence
/// verbatim, error elements and attributes included.
#[derive(Debug, Default)]
pub struct Nodes {
    out: Option<RedisResult<NodeList>>,
}

impl Nodes {
    pub fn new() -> Nodes {
        Nodes::default()
    }

    pub fn value(&self) -> Option<&NodeList> {
        match &self.out {
            Some(Ok(value)) => Some(value),
            _ => None,
        }
    }

    pub fn into_result(self) -> RedisResult<NodeList> {
        self.out.unwrap_or_else(|| Err(unfilled_error()))
    }
}

impl Slot for Nodes {
    fn fill(&mut self, tree: TreeRef<'_>) -> RedisResult<()> {
        self.out = Some(Ok(tree.nodes().to_vec()));
        Ok(())
    }

    fn fail(&mut self, err: RedisError) {
        self.out = Some(Err(err));
    }
}

macro_rules! tuple_slot_impl {
    ($(($name:ident, $idx:tt)),+) => {
        // A tuple of slots adapts an aggregate positionally: child `i` goes
        // into element `i`.  This is how transaction replies are consumed.
        impl<$($name: Slot),+> Slot for ($($name,)+) {
            fn fill(&mut self, tree: TreeRef<'_>) -> RedisResult<()> {
                const LEN: usize = [$(stringify!($name)),+].len();
                let shape = check_server_error(&tree).and_then(|()| {
                    let root = tree.root()?;
                    if !root.kind.is_aggregate() {
                        fail!((
                            ErrorKind::IncompatibleType,
                            "Expected an aggregate for a tuple of slots",
                            root.kind.to_string()
                        ));
                    }
                    Ok(())
                });
                if let Err(err) = shape {
                    $( self.$idx.fail(err.clone_mostly()); )+
                    return Err(err);
                }
                let children: Vec<TreeRef<'_>> = tree.children().collect();
                if children.len() != LEN {
                    let err = RedisError::from((
                        ErrorKind::UnexpectedSize,
                        "Aggregate size does not match the slot tuple",
                        format!("{} != {LEN}", children.len()),
                    ));
                    $( self.$idx.fail(err.clone_mostly()); )+
                    return Err(err);
                }
                let mut first_err = None;
                let mut children = children.into_iter();
                $(
                    if let Err(err) = self.$idx.fill(children.next().expect("length checked")) {
                        if first_err.is_none() {
                            first_err = Some(err);
                        }
                    }
                )+
                match first_err {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }

            fn fail(&mut self, err: RedisError) {
                $( self.$idx.fail(err.clone_mostly()); )+
            }
        }
    };
}

tuple_slot_impl!((A, 0));
tuple_slot_impl!((A, 0), (B, 1));
tuple_slot_impl!((A, 0), (B, 1), (C, 2));
tuple_slot_impl!((A, 0), (B, 1), (C, 2), (D, 3));
tuple_slot_impl!((A, 0), (B, 1), (C, 2), (D, 3), (E, 4));
tuple_slot_impl!((A, 0), (B, 1), (C, 2), (D, 3), (E, 4), (F, 5));
tuple_slot_impl!((A, 0), (B, 1), (C, 2), (D, 3), (E, 4), (F, 5), (G, 6));
tuple_slot_impl!((A, 0), (B, 1), (C, 2), (D, 3), (E, 4), (F, 5), (G, 6), (H, 7));

/// The reply destination of a whole request: one slot per command that
/// produces a reply.
///
/// Implemented by tuples of slots, by every slot type used on its own, by
/// `()` for requests without replies and by [`Ignore`] as the variadic
/// throw-everything-away sink.
pub trait ResponseSink {
    /// Number of slots, or `None` when the sink accepts any number of
    /// replies.
    fn slot_count(&self) -> Option<usize>;

    /// The slot for reply `index`.
    fn slot_mut(&mut self, index: usize) -> &mut dyn Slot;
}

impl ResponseSink for Ignore {
    fn slot_count(&self) -> Option<usize> {
        None
    }

    fn slot_mut(&mut self, _: usize) -> &mut dyn Slot {
        self
    }
}

impl ResponseSink for () {
    fn slot_count(&self) -> Option<usize> {
        Some(0)
    }

    fn slot_mut(&mut self, _: usize) -> &mut dyn Slot {
        unreachable!("the unit sink has no slots")
    }
}

macro_rules! single_slot_sink_impl {
    ($($t:ty => [$($generics:tt)*]),+ $(,)?) => {
        $(
            impl<$($generics)*> ResponseSink for $t {
                fn slot_count(&self) -> Option<usize> {
                    Some(1)
                }

                fn slot_mut(&mut self, _: usize) -> &mut dyn Slot {
                    self
                }
            }
        )+
    };
}

single_slot_sink_impl!(
    One<T> => [T: FromBulk],
    Opt<S> => [S: Slot],
    Seq<T> => [T: FromBulk],
    MapOf<K, V> => [K: FromBulk, V: FromBulk],
    SetOf<T> => [T: FromBulk + Ord],
);

impl ResponseSink for Nodes {
    fn slot_count(&self) -> Option<usize> {
        Some(1)
    }

    fn slot_mut(&mut self, _: usize) -> &mut dyn Slot {
        self
    }
}

macro_rules! tuple_sink_impl {
    ($(($name:ident, $idx:tt)),+) => {
        impl<$($name: Slot),+> ResponseSink for ($($name,)+) {
            fn slot_count(&self) -> Option<usize> {
                Some([$(stringify!($name)),+].len())
            }

            fn slot_mut(&mut self, index: usize) -> &mut dyn Slot {
                match index {
                    $( $idx => &mut self.$idx, )+
                    _ => unreachable!("slot index out of range"),
                }
            }
        }
    };
}

tuple_sink_impl!((A, 0));
tuple_sink_impl!((A, 0), (B, 1));
tuple_sink_impl!((A, 0), (B, 1), (C, 2));
tuple_sink_impl!((A, 0), (B, 1), (C, 2), (D, 3));
tuple_sink_impl!((A, 0), (B, 1), (C, 2), (D, 3), (E, 4));
tuple_sink_impl!((A, 0), (B, 1), (C, 2), (D, 3), (E, 4), (F, 5));
tuple_sink_impl!((A, 0), (B, 1), (C, 2), (D, 3), (E, 4), (F, 5), (G, 6));
tuple_sink_impl!((A, 0), (B, 1), (C, 2), (D, 3), (E, 4), (F, 5), (G, 6), (H, 7));
