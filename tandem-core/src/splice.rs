//! Text splices: the single contiguous change between two versions of a
//! document, as produced by an editor surface.

/// One contiguous replacement, in character offsets.
///
/// Characters `start..old_end` of the old text were replaced by
/// characters `start..new_end` of the new text. Either range may be empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Splice {
    pub start: usize,
    pub old_end: usize,
    pub new_end: usize,
}

impl Splice {
    /// Compute the splice turning `old` into `new`.
    ///
    /// Trims the common prefix, then the common suffix of what is left.
    /// Returns `None` when the texts are equal.
    pub fn between(old: &str, new: &str) -> Option<Self> {
        let old: Vec<char> = old.chars().collect();
        let new: Vec<char> = new.chars().collect();

        let start = old
            .iter()
            .zip(new.iter())
            .take_while(|(a, b)| a == b)
            .count();

        let mut old_end = old.len();
        let mut new_end = new.len();
        while old_end > start && new_end > start && old[old_end - 1] == new[new_end - 1] {
            old_end -= 1;
            new_end -= 1;
        }

        let splice = Self {
            start,
            old_end,
            new_end,
        };
        if splice.is_noop() {
            None
        } else {
            Some(splice)
        }
    }

    pub fn removed_len(&self) -> usize {
        self.old_end - self.start
    }

    pub fn inserted_len(&self) -> usize {
        self.new_end - self.start
    }

    pub fn is_noop(&self) -> bool {
        self.removed_len() == 0 && self.inserted_len() == 0
    }

    /// The inserted characters, taken from the new text.
    pub fn inserted<'a>(&self, new_text: &'a str) -> impl Iterator<Item = char> + 'a {
        new_text.chars().skip(self.start).take(self.inserted_len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_texts() {
        assert_eq!(Splice::between("abc", "abc"), None);
        assert_eq!(Splice::between("", ""), None);
    }

    #[test]
    fn test_pure_insert() {
        let s = Splice::between("Hllo", "Hello").unwrap();
        assert_eq!(s, Splice { start: 1, old_end: 1, new_end: 2 });
        assert_eq!(s.inserted("Hello").collect::<String>(), "e");
    }

    #[test]
    fn test_pure_delete() {
        let s = Splice::between("Hello", "Helo").unwrap();
        assert_eq!(s.start, 3);
        assert_eq!(s.removed_len(), 1);
        assert_eq!(s.inserted_len(), 0);
    }

    #[test]
    fn test_replacement() {
        let s = Splice::between("the cat sat", "the dog sat").unwrap();
        assert_eq!(s, Splice { start: 4, old_end: 7, new_end: 7 });
        assert_eq!(s.inserted("the dog sat").collect::<String>(), "dog");
    }

    #[test]
    fn test_repeated_characters_do_not_overlap() {
        // Prefix and suffix scans must not both claim the same 'a'.
        let s = Splice::between("aa", "aaa").unwrap();
        assert_eq!(s.removed_len(), 0);
        assert_eq!(s.inserted_len(), 1);
    }

    #[test]
    fn test_multibyte_offsets_are_chars() {
        let s = Splice::between("héllo", "hé!llo").unwrap();
        assert_eq!(s.start, 2);
        assert_eq!(s.inserted("hé!llo").collect::<String>(), "!");
    }
}
