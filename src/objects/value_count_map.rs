use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct U64Count {
    pub value: u64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct StringCount {
    pub value: String,
    pub count: u64,
}

/// Histogram of a numeric job attribute (priority, minimum request age).
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ValueCountMapU64 {
    entries: Vec<U64Count>,
}

impl ValueCountMapU64 {
    pub fn inc(&mut self, value: u64) {
        match self.entries.iter_mut().find(|e| e.value == value) {
            Some(e) => e.count += 1,
            None => self.entries.push(U64Count { value, count: 1 }),
        }
    }

    /// Decrement; entries reaching zero disappear. Unknown values are ignored.
    pub fn dec(&mut self, value: u64) {
        if let Some(pos) = self.entries.iter().position(|e| e.value == value) {
            self.entries[pos].count -= 1;
            if self.entries[pos].count == 0 {
                self.entries.swap_remove(pos);
            }
        }
    }

    pub fn max_value(&self) -> Option<u64> {
        self.entries.iter().map(|e| e.value).max()
    }

    pub fn min_value(&self) -> Option<u64> {
        self.entries.iter().map(|e| e.value).min()
    }

    pub fn total(&self) -> u64 {
        self.entries.iter().map(|e| e.count).sum()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Histogram of a string job attribute (mount policy name).
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ValueCountMapString {
    entries: Vec<StringCount>,
}

impl ValueCountMapString {
    pub fn inc(&mut self, value: &str) {
        match self.entries.iter_mut().find(|e| e.value == value) {
            Some(e) => e.count += 1,
            None => self.entries.push(StringCount {
                value: value.to_string(),
                count: 1,
            }),
        }
    }

    pub fn dec(&mut self, value: &str) {
        if let Some(pos) = self.entries.iter().position(|e| e.value == value) {
            self.entries[pos].count -= 1;
            if self.entries[pos].count == 0 {
                self.entries.swap_remove(pos);
            }
        }
    }

    pub fn counts(&self) -> Vec<(String, u64)> {
        let mut counts: Vec<(String, u64)> = self
            .entries
            .iter()
            .map(|e| (e.value.clone(), e.count))
            .collect();
        counts.sort();
        counts
    }

    pub fn total(&self) -> u64 {
        self.entries.iter().map(|e| e.count).sum()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
