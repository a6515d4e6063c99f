//! A minimal intrusive doubly linked list, used throughout the crate to queue pending operations
//! without allocating a node per element.
//!
//! The links live inside the element itself as a [Links] field, and an element type exposes that
//! field through the [Linked] trait. The `Tag` type parameter selects which [Links] field a given
//! list uses, so a single element type can sit on several distinct lists at the same time as long
//! as each list uses a different tag.
//!
//! The list owns none of its elements. Whoever inserts an element is responsible for keeping it
//! alive, and at a stable address, until it is removed again. This is why the inserting
//! operations are `unsafe`.
//!
//! Linking an element that is already linked is a programming error and panics, as continuing
//! would silently corrupt some other list.

use std::{cell::UnsafeCell, fmt, marker::PhantomData, marker::PhantomPinned, ptr::NonNull};

/// The pair of links embedded in a host element. Both links are `None` if and only if the node
/// is not on any list, otherwise they point at valid neighbors, possibly the list's sentinel.
pub struct Links<T> {
    prev: UnsafeCell<Option<NonNull<Links<T>>>>,
    next: UnsafeCell<Option<NonNull<Links<T>>>>,
    item: UnsafeCell<Option<NonNull<T>>>,
    _pin: PhantomPinned,
}

// SAFETY: The links are only ever read or written by the holder of the lock protecting the list
// the node is on, the pointers themselves carry no ownership.
unsafe impl<T> Send for Links<T> {}
unsafe impl<T> Sync for Links<T> {}

impl<T> Links<T> {
    /// Create a new unlinked node.
    pub const fn new() -> Links<T> {
        Links {
            prev: UnsafeCell::new(None),
            next: UnsafeCell::new(None),
            item: UnsafeCell::new(None),
            _pin: PhantomPinned,
        }
    }

    /// Whether this node is currently linked into a list.
    pub fn is_linked(&self) -> bool {
        self.next().is_some()
    }

    /// Detach this node from whatever list it is on. Unlike [IntrusiveList::remove] this
    /// tolerates a node that is not linked at all, returning `false` in that case.
    ///
    /// # Safety
    ///
    /// The caller must hold whatever lock protects the list this node is on, and that list must
    /// still be alive.
    pub unsafe fn unlink(&self) -> bool {
        let (Some(prev), Some(next)) = (self.prev(), self.next()) else {
            return false;
        };
        prev.as_ref().set_next(Some(next));
        next.as_ref().set_prev(Some(prev));
        self.clear();
        true
    }

    fn prev(&self) -> Option<NonNull<Links<T>>> {
        unsafe { *self.prev.get() }
    }

    fn next(&self) -> Option<NonNull<Links<T>>> {
        unsafe { *self.next.get() }
    }

    fn item(&self) -> Option<NonNull<T>> {
        unsafe { *self.item.get() }
    }

    fn set_prev(&self, val: Option<NonNull<Links<T>>>) {
        unsafe { *self.prev.get() = val }
    }

    fn set_next(&self, val: Option<NonNull<Links<T>>>) {
        unsafe { *self.next.get() = val }
    }

    fn set_item(&self, val: Option<NonNull<T>>) {
        unsafe { *self.item.get() = val }
    }

    fn clear(&self) {
        self.set_prev(None);
        self.set_next(None);
        self.set_item(None);
    }

    fn as_ptr(&self) -> NonNull<Links<T>> {
        NonNull::from(self)
    }
}

impl<T> Default for Links<T> {
    fn default() -> Self {
        Links::new()
    }
}

impl<T> fmt::Debug for Links<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Links")
            .field("linked", &self.is_linked())
            .finish()
    }
}

/// Link accessor implemented by element types, one implementation per list tag.
///
/// # Safety
///
/// `links` must always return the very same [Links] field for a given element and tag, and no
/// two tags may share a field.
pub unsafe trait Linked<Tag>: Sized {
    fn links(&self) -> &Links<Self>;
}

/// An intrusive list over elements of type `T`, linked through the `Tag` field of `T`.
pub struct IntrusiveList<T, Tag = ()>
where
    T: Linked<Tag>,
{
    // The sentinel lives on the heap so that the list itself can move while elements point at
    // it. It is self-linked lazily, an untouched sentinel reads as an empty list.
    head: NonNull<Links<T>>,
    _tag: PhantomData<fn() -> Tag>,
}

// SAFETY: The list only hands out pointers to elements which are themselves shareable.
unsafe impl<T, Tag> Send for IntrusiveList<T, Tag> where T: Linked<Tag> + Send + Sync {}
unsafe impl<T, Tag> Sync for IntrusiveList<T, Tag> where T: Linked<Tag> + Send + Sync {}

impl<T, Tag> IntrusiveList<T, Tag>
where
    T: Linked<Tag>,
{
    /// Create a new empty list.
    pub fn new() -> IntrusiveList<T, Tag> {
        IntrusiveList {
            head: NonNull::from(Box::leak(Box::new(Links::new()))),
            _tag: PhantomData,
        }
    }

    fn head(&self) -> &Links<T> {
        // SAFETY: The sentinel is allocated in new() and only freed on drop.
        unsafe { self.head.as_ref() }
    }

    fn sentinel(&self) -> NonNull<Links<T>> {
        self.head
    }

    fn init(&mut self) {
        if self.head().next().is_none() {
            let sentinel = self.sentinel();
            self.head().set_next(Some(sentinel));
            self.head().set_prev(Some(sentinel));
        }
    }

    fn item_of(&self, node: Option<NonNull<Links<T>>>) -> Option<NonNull<T>> {
        match node {
            Some(node) if node != self.sentinel() => unsafe { node.as_ref().item() },
            _ => None,
        }
    }

    /// Whether the list holds no elements.
    pub fn is_empty(&self) -> bool {
        match self.head().next() {
            None => true,
            Some(next) => next == self.sentinel(),
        }
    }

    /// The first element, if any.
    pub fn first(&self) -> Option<NonNull<T>> {
        self.item_of(self.head().next())
    }

    /// The last element, if any.
    pub fn last(&self) -> Option<NonNull<T>> {
        self.item_of(self.head().prev())
    }

    /// The element following `item`, or `None` if `item` is the last element or is not linked.
    pub fn next(&self, item: &T) -> Option<NonNull<T>> {
        self.item_of(item.links().next())
    }

    /// The element preceding `item`, or `None` if `item` is the first element or is not linked.
    pub fn prev(&self, item: &T) -> Option<NonNull<T>> {
        self.item_of(item.links().prev())
    }

    /// Whether `item` is currently linked through this list's tag.
    pub fn is_active(&self, item: &T) -> bool {
        item.links().is_linked()
    }

    /// # Safety
    ///
    /// `node` must be unlinked and `prev`/`next` must be adjacent nodes of this list.
    unsafe fn link_between(
        &self,
        item: &T,
        prev: NonNull<Links<T>>,
        next: NonNull<Links<T>>,
    ) {
        let node = item.links();
        node.set_item(Some(NonNull::from(item)));
        node.set_prev(Some(prev));
        node.set_next(Some(next));
        next.as_ref().set_prev(Some(node.as_ptr()));
        prev.as_ref().set_next(Some(node.as_ptr()));
    }

    /// Append `item` to the tail of the list.
    ///
    /// # Panics
    ///
    /// Panics if `item` is already linked into a list.
    ///
    /// # Safety
    ///
    /// `item` must stay alive, and must not move, until it has been removed from the list.
    pub unsafe fn append(&mut self, item: &T) {
        if item.links().is_linked() {
            panic!("appending node already on a list");
        }
        self.init();
        let tail = self.head().prev().unwrap_or(self.sentinel());
        self.link_between(item, tail, self.sentinel());
    }

    /// Prepend `item` to the head of the list.
    ///
    /// # Panics
    ///
    /// Panics if `item` is already linked into a list.
    ///
    /// # Safety
    ///
    /// Same requirements as [IntrusiveList::append].
    pub unsafe fn prepend(&mut self, item: &T) {
        if item.links().is_linked() {
            panic!("prepending node already on a list");
        }
        self.init();
        let first = self.head().next().unwrap_or(self.sentinel());
        self.link_between(item, self.sentinel(), first);
    }

    /// Insert `item` immediately before `before`, which must be on this list.
    ///
    /// # Panics
    ///
    /// Panics if `item` is already linked, or `before` is not.
    ///
    /// # Safety
    ///
    /// Same requirements as [IntrusiveList::append], and `before` must be linked on this list.
    pub unsafe fn insert_before(&mut self, item: &T, before: &T) {
        if item.links().is_linked() {
            panic!("inserting node already on a list");
        }
        let Some(prev) = before.links().prev() else {
            panic!("inserting relative to a node that is not on a list");
        };
        self.link_between(item, prev, before.links().as_ptr());
    }

    /// Insert `item` immediately after `after`, which must be on this list.
    ///
    /// # Panics
    ///
    /// Panics if `item` is already linked, or `after` is not.
    ///
    /// # Safety
    ///
    /// Same requirements as [IntrusiveList::append], and `after` must be linked on this list.
    pub unsafe fn insert_after(&mut self, item: &T, after: &T) {
        if item.links().is_linked() {
            panic!("inserting node already on a list");
        }
        let Some(next) = after.links().next() else {
            panic!("inserting relative to a node that is not on a list");
        };
        self.link_between(item, after.links().as_ptr(), next);
    }

    /// Remove `item` from the list, clearing its links.
    ///
    /// # Panics
    ///
    /// Panics if `item` is not linked. Use [Links::unlink] where linkage can't be tracked.
    ///
    /// # Safety
    ///
    /// `item` must be linked on this list rather than some other list of the same tag.
    pub unsafe fn remove(&mut self, item: &T) {
        if !item.links().unlink() {
            panic!("removing node that is not on a list");
        }
    }

    /// Remove and return the first element.
    pub fn pop_front(&mut self) -> Option<NonNull<T>> {
        let first = self.first()?;
        // SAFETY: Elements are alive for as long as they are linked.
        unsafe { first.as_ref().links().unlink() };
        Some(first)
    }

    /// Move the entire contents of `src` onto the tail of `dst` in constant time, leaving `src`
    /// empty. Both lists share the same element type and tag, and so the same link field.
    pub fn move_all(src: &mut Self, dst: &mut Self) {
        if src.is_empty() {
            return;
        }
        dst.init();

        let (Some(first), Some(last), Some(tail)) =
            (src.head().next(), src.head().prev(), dst.head().prev())
        else {
            unreachable!("non-empty list with unset links");
        };

        // SAFETY: Every node reachable from either sentinel is alive by the insertion contract.
        unsafe {
            tail.as_ref().set_next(Some(first));
            first.as_ref().set_prev(Some(tail));
            last.as_ref().set_next(Some(dst.sentinel()));
        }
        dst.head().set_prev(Some(last));

        let sentinel = src.sentinel();
        src.head().set_next(Some(sentinel));
        src.head().set_prev(Some(sentinel));
    }

    /// Iterate over the elements from head to tail.
    pub fn iter(&self) -> Iter<'_, T, Tag> {
        Iter {
            list: self,
            next: self.first(),
        }
    }
}

impl<T, Tag> Default for IntrusiveList<T, Tag>
where
    T: Linked<Tag>,
{
    fn default() -> Self {
        IntrusiveList::new()
    }
}

impl<T, Tag> Drop for IntrusiveList<T, Tag>
where
    T: Linked<Tag>,
{
    fn drop(&mut self) {
        // Leave no element pointing at a freed sentinel.
        while self.pop_front().is_some() {}
        // SAFETY: Allocated with Box in new(), nothing links to it anymore.
        drop(unsafe { Box::from_raw(self.head.as_ptr()) });
    }
}

impl<T, Tag> fmt::Debug for IntrusiveList<T, Tag>
where
    T: Linked<Tag>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntrusiveList")
            .field("empty", &self.is_empty())
            .finish()
    }
}

/// Iterator over the elements of an [IntrusiveList].
pub struct Iter<'a, T, Tag>
where
    T: Linked<Tag>,
{
    list: &'a IntrusiveList<T, Tag>,
    next: Option<NonNull<T>>,
}

impl<'a, T, Tag> Iterator for Iter<'a, T, Tag>
where
    T: Linked<Tag> + 'a,
{
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let item = unsafe { self.next?.as_ref() };
        self.next = self.list.next(item);
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    enum TagA {}
    enum TagB {}

    struct Item {
        id: u32,
        a: Links<Item>,
        b: Links<Item>,
    }

    impl Item {
        fn new(id: u32) -> Item {
            Item {
                id,
                a: Links::new(),
                b: Links::new(),
            }
        }
    }

    unsafe impl Linked<TagA> for Item {
        fn links(&self) -> &Links<Self> {
            &self.a
        }
    }

    unsafe impl Linked<TagB> for Item {
        fn links(&self) -> &Links<Self> {
            &self.b
        }
    }

    fn ids<Tag>(list: &IntrusiveList<Item, Tag>) -> Vec<u32>
    where
        Item: Linked<Tag>,
    {
        list.iter().map(|item| item.id).collect()
    }

    fn id(ptr: Option<NonNull<Item>>) -> Option<u32> {
        ptr.map(|ptr| unsafe { ptr.as_ref().id })
    }

    #[test]
    fn test_default_is_empty() {
        let list: IntrusiveList<Item, TagA> = IntrusiveList::default();
        assert!(list.is_empty());
        assert!(list.first().is_none());
        assert!(list.last().is_none());
    }

    #[test]
    fn test_append_prepend_insert() {
        let items: Vec<Item> = (0..5).map(Item::new).collect();
        let mut list: IntrusiveList<Item, TagA> = IntrusiveList::new();

        unsafe {
            list.append(&items[1]);
            list.append(&items[3]);
            list.prepend(&items[0]);
            list.insert_before(&items[2], &items[3]);
            list.insert_after(&items[4], &items[3]);
        }

        assert_eq!(ids(&list), vec![0, 1, 2, 3, 4]);
        assert_eq!(id(list.first()), Some(0));
        assert_eq!(id(list.last()), Some(4));
        assert_eq!(id(list.next(&items[2])), Some(3));
        assert_eq!(id(list.prev(&items[2])), Some(1));
        assert_eq!(id(list.next(&items[4])), None);
        assert_eq!(id(list.prev(&items[0])), None);
    }

    #[test]
    fn test_remove_restores_state() {
        let items: Vec<Item> = (0..3).map(Item::new).collect();
        let extra = Item::new(9);
        let mut list: IntrusiveList<Item, TagA> = IntrusiveList::new();

        unsafe {
            for item in items.iter() {
                list.append(item);
            }
            list.append(&extra);
            assert!(list.is_active(&extra));
            list.remove(&extra);
        }

        assert!(!list.is_active(&extra));
        assert!(!extra.a.is_linked());
        assert_eq!(ids(&list), vec![0, 1, 2]);
        assert_eq!(id(list.last()), Some(2));
        assert_eq!(id(list.next(&items[2])), None);
    }

    #[test]
    fn test_unlink_tolerates_detached() {
        let item = Item::new(1);
        let mut list: IntrusiveList<Item, TagA> = IntrusiveList::new();

        assert!(!unsafe { item.a.unlink() });

        unsafe { list.append(&item) };
        assert!(unsafe { item.a.unlink() });
        assert!(list.is_empty());
        assert!(!unsafe { item.a.unlink() });
    }

    #[test]
    fn test_distinct_tags_are_independent() {
        let items: Vec<Item> = (0..3).map(Item::new).collect();
        let mut a: IntrusiveList<Item, TagA> = IntrusiveList::new();
        let mut b: IntrusiveList<Item, TagB> = IntrusiveList::new();

        unsafe {
            for item in items.iter() {
                a.append(item);
                b.prepend(item);
            }
            b.remove(&items[1]);
        }

        assert_eq!(ids(&a), vec![0, 1, 2]);
        assert_eq!(ids(&b), vec![2, 0]);
        assert!(a.is_active(&items[1]));
        assert!(!b.is_active(&items[1]));
    }

    #[test]
    fn test_move_all() {
        let items: Vec<Item> = (0..6).map(Item::new).collect();
        let mut src: IntrusiveList<Item, TagA> = IntrusiveList::new();
        let mut dst: IntrusiveList<Item, TagA> = IntrusiveList::new();

        unsafe {
            for item in items[..2].iter() {
                dst.append(item);
            }
            for item in items[2..].iter() {
                src.append(item);
            }
        }

        IntrusiveList::move_all(&mut src, &mut dst);

        assert!(src.is_empty());
        assert_eq!(ids(&dst), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(id(dst.last()), Some(5));
        assert_eq!(id(dst.prev(&items[2])), Some(1));

        // Removing a moved element must patch the destination, not the source.
        unsafe { dst.remove(&items[5]) };
        assert_eq!(id(dst.last()), Some(4));
        assert!(src.is_empty());
    }

    #[test]
    fn test_move_all_into_empty_and_from_empty() {
        let items: Vec<Item> = (0..2).map(Item::new).collect();
        let mut src: IntrusiveList<Item, TagA> = IntrusiveList::new();
        let mut dst: IntrusiveList<Item, TagA> = IntrusiveList::new();

        IntrusiveList::move_all(&mut src, &mut dst);
        assert!(dst.is_empty());

        unsafe {
            src.append(&items[0]);
            src.append(&items[1]);
        }
        IntrusiveList::move_all(&mut src, &mut dst);
        assert_eq!(ids(&dst), vec![0, 1]);
        assert!(src.is_empty());
    }

    #[test]
    #[should_panic(expected = "already on a list")]
    fn test_double_append_panics() {
        let item = Item::new(1);
        let mut first: IntrusiveList<Item, TagA> = IntrusiveList::new();
        let mut second: IntrusiveList<Item, TagA> = IntrusiveList::new();
        unsafe {
            first.append(&item);
            second.append(&item);
        }
    }

    #[test]
    #[should_panic(expected = "not on a list")]
    fn test_remove_detached_panics() {
        let item = Item::new(1);
        let mut list: IntrusiveList<Item, TagA> = IntrusiveList::new();
        unsafe { list.remove(&item) };
    }

    #[test]
    fn test_drop_detaches_elements() {
        let item = Item::new(1);
        {
            let mut list: IntrusiveList<Item, TagA> = IntrusiveList::new();
            unsafe { list.append(&item) };
        }
        assert!(!item.a.is_linked());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Append(usize),
        Prepend(usize),
        Remove(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..8usize).prop_map(Op::Append),
            (0..8usize).prop_map(Op::Prepend),
            (0..8usize).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn prop_matches_model(ops in prop::collection::vec(op(), 0..64)) {
            let items: Vec<Box<Item>> = (0..8).map(|id| Box::new(Item::new(id))).collect();
            let mut list: IntrusiveList<Item, TagA> = IntrusiveList::new();
            let mut model: Vec<u32> = Vec::new();

            for op in ops {
                match op {
                    Op::Append(idx) if !list.is_active(&items[idx]) => {
                        unsafe { list.append(&items[idx]) };
                        model.push(idx as u32);
                    }
                    Op::Prepend(idx) if !list.is_active(&items[idx]) => {
                        unsafe { list.prepend(&items[idx]) };
                        model.insert(0, idx as u32);
                    }
                    Op::Remove(idx) if list.is_active(&items[idx]) => {
                        unsafe { list.remove(&items[idx]) };
                        model.retain(|id| *id != idx as u32);
                    }
                    _ => {}
                }
                prop_assert_eq!(list.is_empty(), model.is_empty());
                prop_assert_eq!(ids(&list), model.clone());
            }
            drop(list);
        }

        #[test]
        fn prop_append_remove_is_identity(count in 0..8usize) {
            let items: Vec<Box<Item>> = (0..9).map(|id| Box::new(Item::new(id))).collect();
            let mut list: IntrusiveList<Item, TagA> = IntrusiveList::new();
            for item in items[..count].iter() {
                unsafe { list.append(item) };
            }
            let before = ids(&list);
            let probe = &items[8];

            unsafe {
                list.append(probe);
                list.remove(probe);
            }
            prop_assert_eq!(ids(&list), before);
            prop_assert_eq!(list.is_empty(), count == 0);
            drop(list);
        }
    }
}
