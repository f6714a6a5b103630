use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, IoContext, Result};

pub const IMAGES_PER_CLASS: usize = 12_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Valid, Split::Test];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Half-open range of image indices, `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRange {
    pub start: usize,
    pub end: usize,
}

impl IndexRange {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overlaps(&self, other: &IndexRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSpec {
    /// File name prefix in the raw folder, e.g. `cat` for `cat.17.jpg`.
    pub prefix: String,
    /// Directory the class lands in under each split, e.g. `cats`.
    pub dir_name: String,
}

impl ClassSpec {
    pub fn new(prefix: &str, dir_name: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            dir_name: dir_name.to_string(),
        }
    }

    pub fn file_name(&self, index: usize) -> String {
        format!("{}.{}.jpg", self.prefix, index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitPlan {
    pub classes: Vec<ClassSpec>,
    pub ranges: [(Split, IndexRange); 3],
    pub total: usize,
}

impl Default for SplitPlan {
    fn default() -> Self {
        Self {
            classes: vec![ClassSpec::new("cat", "cats"), ClassSpec::new("dog", "dogs")],
            ranges: [
                (Split::Train, IndexRange::new(0, 10_000)),
                (Split::Valid, IndexRange::new(10_000, 11_250)),
                (Split::Test, IndexRange::new(11_250, IMAGES_PER_CLASS)),
            ],
            total: IMAGES_PER_CLASS,
        }
    }
}

impl SplitPlan {
    /// Checks that every split is non-empty, that no two splits share an
    /// index and that together they cover `0..total` exactly.
    pub fn validate(&self) -> Result<()> {
        if self.classes.is_empty() {
            return Err(Error::InvalidSplit("no classes configured".into()));
        }

        for split in Split::ALL {
            let count = self.ranges.iter().filter(|(s, _)| *s == split).count();
            if count != 1 {
                return Err(Error::InvalidSplit(format!(
                    "split '{split}' appears {count} times"
                )));
            }
        }

        for (split, range) in &self.ranges {
            if range.is_empty() {
                return Err(Error::InvalidSplit(format!(
                    "split '{split}' has empty range {}..{}",
                    range.start, range.end
                )));
            }
        }

        for (i, (a_split, a)) in self.ranges.iter().enumerate() {
            for (b_split, b) in &self.ranges[i + 1..] {
                if a.overlaps(b) {
                    return Err(Error::InvalidSplit(format!(
                        "'{a_split}' {}..{} overlaps '{b_split}' {}..{}",
                        a.start, a.end, b.start, b.end
                    )));
                }
            }
        }

        let mut sorted: Vec<IndexRange> = self.ranges.iter().map(|(_, r)| *r).collect();
        sorted.sort_by_key(|r| r.start);

        let mut cursor = 0;
        for range in sorted {
            if range.start != cursor {
                return Err(Error::InvalidSplit(format!(
                    "indices {}..{} are not assigned to any split",
                    cursor, range.start
                )));
            }
            cursor = range.end;
        }
        if cursor != self.total {
            return Err(Error::InvalidSplit(format!(
                "splits end at {cursor} but the class has {} images",
                self.total
            )));
        }

        Ok(())
    }

    pub fn split_dir(&self, base: &Path, split: Split) -> PathBuf {
        base.join(split.dir_name())
    }

    pub fn class_dir(&self, base: &Path, split: Split, class: &ClassSpec) -> PathBuf {
        self.split_dir(base, split).join(&class.dir_name)
    }
}

/// Number of files per split and class directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitSummary {
    pub counts: BTreeMap<Split, BTreeMap<String, usize>>,
}

impl SplitSummary {
    pub fn count(&self, split: Split, class_dir: &str) -> usize {
        self.counts
            .get(&split)
            .and_then(|classes| classes.get(class_dir))
            .copied()
            .unwrap_or(0)
    }

    pub fn class_total(&self, class_dir: &str) -> usize {
        Split::ALL
            .iter()
            .map(|split| self.count(*split, class_dir))
            .sum()
    }

    /// Recounts the files that actually landed in the tree.
    pub fn count_tree(base: &Path, plan: &SplitPlan) -> Result<Self> {
        let mut summary = Self::default();
        for split in Split::ALL {
            for class in &plan.classes {
                let dir = plan.class_dir(base, split, class);
                let count = fs::read_dir(&dir).at(&dir)?.count();
                summary
                    .counts
                    .entry(split)
                    .or_default()
                    .insert(class.dir_name.clone(), count);
            }
        }
        Ok(summary)
    }

    pub fn log(&self) {
        for (split, classes) in &self.counts {
            for (class, count) in classes {
                info!("{split}/{class}: {count} images");
            }
        }
        if let Some(classes) = self.counts.get(&Split::Train) {
            for class in classes.keys() {
                info!("{class}: {} images in total", self.class_total(class));
            }
        }
    }
}

/// Counts the files in `source` whose names start with each class prefix.
pub fn count_classes(source: &Path, classes: &[ClassSpec]) -> Result<BTreeMap<String, usize>> {
    let mut counts: BTreeMap<String, usize> = classes
        .iter()
        .map(|class| (class.prefix.clone(), 0))
        .collect();

    for entry in fs::read_dir(source).at(source)? {
        let entry = entry.at(source)?;
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if let Some(class) = classes
            .iter()
            .find(|class| name.starts_with(&format!("{}.", class.prefix)))
        {
            *counts.entry(class.prefix.clone()).or_default() += 1;
        }
    }

    Ok(counts)
}

fn create_tree(base: &Path, plan: &SplitPlan, overwrite: bool) -> Result<()> {
    if base.exists() {
        if !overwrite {
            return Err(Error::DatasetExists(base.to_path_buf()));
        }
        info!("removing existing dataset at {}", base.display());
        fs::remove_dir_all(base).at(base)?;
    }

    fs::create_dir_all(base).at(base)?;
    for split in Split::ALL {
        let split_dir = plan.split_dir(base, split);
        fs::create_dir(&split_dir).at(&split_dir)?;
        for class in &plan.classes {
            let class_dir = plan.class_dir(base, split, class);
            fs::create_dir(&class_dir).at(&class_dir)?;
        }
    }

    Ok(())
}

/// Copies `{prefix}.{index}.jpg` files from the flat `source` folder into
/// `base/{train,valid,test}/{class}` according to `plan`.
///
/// A missing source file aborts the whole run.
pub fn partition(source: &Path, base: &Path, plan: &SplitPlan, overwrite: bool) -> Result<SplitSummary> {
    plan.validate()?;
    create_tree(base, plan, overwrite)?;

    let mut summary = SplitSummary::default();

    for class in &plan.classes {
        for (split, range) in &plan.ranges {
            let dir = plan.class_dir(base, *split, class);

            for index in range.start..range.end {
                let name = class.file_name(index);
                let src = source.join(&name);
                fs::copy(&src, dir.join(&name)).at(&src)?;
            }

            debug!(
                "copied {} {} images ({}..{}) into {}",
                range.len(),
                class.prefix,
                range.start,
                range.end,
                dir.display()
            );

            summary
                .counts
                .entry(*split)
                .or_default()
                .insert(class.dir_name.clone(), range.len());
        }
    }

    Ok(summary)
}
