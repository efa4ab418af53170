use std::sync::Arc;

/// Node correspond to a single entry in the copy-on-write tree. Left
/// and right children are shared between snapshots via Arc; a write
/// path-copies the nodes it touches and leaves every other node
/// untouched for concurrent readers.
#[derive(Clone)]
pub struct Node<K, V> {
    pub key: K,
    pub value: V,
    pub black: bool,                    // store: black or red
    pub left: Option<Arc<Node<K, V>>>,  // store: left child
    pub right: Option<Arc<Node<K, V>>>, // store: right child
}

impl<K, V> Node<K, V> {
    pub fn new(key: K, value: V) -> Node<K, V> {
        Node {
            key,
            value,
            black: false,
            left: None,
            right: None,
        }
    }

    #[inline]
    pub fn set_red(&mut self) {
        self.black = false
    }

    #[inline]
    pub fn set_black(&mut self) {
        self.black = true
    }

    #[inline]
    pub fn toggle_link(&mut self) {
        self.black = !self.black
    }

    #[inline]
    pub fn is_black(node: Option<&Arc<Node<K, V>>>) -> bool {
        node.map_or(true, |node| node.black)
    }

    #[inline]
    pub fn is_red(node: Option<&Arc<Node<K, V>>>) -> bool {
        !Self::is_black(node)
    }

    #[inline]
    pub fn as_left_ref(&self) -> Option<&Arc<Node<K, V>>> {
        self.left.as_ref()
    }

    #[inline]
    pub fn as_right_ref(&self) -> Option<&Arc<Node<K, V>>> {
        self.right.as_ref()
    }
}
