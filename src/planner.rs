//! Split planning: partition a category's staged units into groups that each
//! become one merged container.
//!
//! Greedy sequential packing over a stable order (case-insensitive source
//! container name, then path). A unit is never divided between groups. A unit
//! larger than the ceiling is placed alone in its own group and the group is
//! flagged `oversized`.

use tracing::warn;

use crate::classify::{Category, SourceFile};
use crate::container::CONTAINER_EXTENSION;
use crate::plugin::PLUGIN_EXTENSION;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveGroup {
    pub category:    Category,
    pub files:       Vec<SourceFile>,
    /// Shared stem of the container and its descriptor, e.g. `CCMerged_Textures_Part2`.
    pub stem:        String,
    /// 0 when the category fits one container, otherwise the 1-based part number.
    pub split_index: u32,
    pub size:        u64,
    /// Holds a single unit larger than the ceiling.
    pub oversized:   bool,
}

impl ArchiveGroup {
    /// `<stem> - <Main|Textures>.ba2`
    pub fn container_name(&self) -> String {
        format!("{} - {}.{}", self.stem, self.category.container_suffix(), CONTAINER_EXTENSION)
    }

    /// `<stem>.esl`
    pub fn descriptor_name(&self) -> String {
        format!("{}.{}", self.stem, PLUGIN_EXTENSION)
    }
}

/// Plan the groups for one category. Groups are returned in order; part
/// numbers start at 1.
pub fn plan(category: Category, mut files: Vec<SourceFile>, ceiling: u64, merged_name: &str) -> Vec<ArchiveGroup> {
    files.sort_by(|a, b| {
        a.container
            .to_ascii_lowercase()
            .cmp(&b.container.to_ascii_lowercase())
            .then_with(|| a.path.cmp(&b.path))
    });

    let mut bins: Vec<(Vec<SourceFile>, u64, bool)> = Vec::new();
    let mut current: Vec<SourceFile> = Vec::new();
    let mut current_size = 0u64;

    for file in files {
        if file.size > ceiling {
            warn!(
                container = %file.container,
                size = file.size,
                ceiling,
                "source exceeds the ceiling; placing it in its own group"
            );
            if !current.is_empty() {
                bins.push((std::mem::take(&mut current), current_size, false));
                current_size = 0;
            }
            let size = file.size;
            bins.push((vec![file], size, true));
            continue;
        }
        if !current.is_empty() && current_size + file.size > ceiling {
            bins.push((std::mem::take(&mut current), current_size, false));
            current_size = 0;
        }
        current_size += file.size;
        current.push(file);
    }
    if !current.is_empty() {
        bins.push((current, current_size, false));
    }

    let total = bins.len();
    bins.into_iter()
        .enumerate()
        .map(|(i, (files, size, oversized))| {
            let split_index = if total == 1 { 0 } else { i as u32 + 1 };
            ArchiveGroup {
                category,
                files,
                stem: group_stem(merged_name, category, split_index),
                split_index,
                size,
                oversized,
            }
        })
        .collect()
}

/// The first part carries no suffix so a single-container category keeps the
/// same name as part 1 of a split one.
fn group_stem(merged_name: &str, category: Category, split_index: u32) -> String {
    let base = format!("{merged_name}{}", category.stem_infix());
    if split_index > 1 {
        format!("{base}_Part{split_index}")
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ContentKind;
    use crate::config::GIB;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn unit(name: &str, size: u64) -> SourceFile {
        SourceFile {
            path: PathBuf::from("staging").join(name),
            container: name.to_string(),
            category: Category::Textures,
            size,
            kind: ContentKind::Texture,
        }
    }

    fn sizes(groups: &[ArchiveGroup]) -> Vec<Vec<u64>> {
        groups.iter().map(|g| g.files.iter().map(|f| f.size).collect()).collect()
    }

    #[test]
    fn four_four_one_at_seven() {
        let files = vec![unit("ccA", 4 * GIB), unit("ccB", 4 * GIB), unit("ccC", GIB)];
        let groups = plan(Category::Textures, files, 7 * GIB, "CCMerged");
        assert_eq!(sizes(&groups), vec![vec![4 * GIB], vec![4 * GIB, GIB]]);
        assert_eq!(groups[1].size, 5 * GIB);
        assert!(groups.iter().all(|g| !g.oversized));
    }

    #[test]
    fn names_and_split_indices() {
        let files = vec![unit("ccA", 6), unit("ccB", 6), unit("ccC", 6)];
        let groups = plan(Category::Textures, files, 10, "CCMerged");
        let names: Vec<String> = groups.iter().map(ArchiveGroup::container_name).collect();
        assert_eq!(names, [
            "CCMerged_Textures - Textures.ba2",
            "CCMerged_Textures_Part2 - Textures.ba2",
            "CCMerged_Textures_Part3 - Textures.ba2",
        ]);
        assert_eq!(groups.iter().map(|g| g.split_index).collect::<Vec<_>>(), [1, 2, 3]);
        assert_eq!(groups[1].descriptor_name(), "CCMerged_Textures_Part2.esl");
    }

    #[test]
    fn single_group_has_split_index_zero() {
        let mut file = unit("ccA", 1);
        file.category = Category::General;
        let groups = plan(Category::General, vec![file], 10, "CCMerged");
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].split_index, 0);
        assert_eq!(groups[0].container_name(), "CCMerged - Main.ba2");
        assert_eq!(groups[0].descriptor_name(), "CCMerged.esl");
    }

    #[test]
    fn oversized_source_goes_alone() {
        let files = vec![unit("ccA", 3), unit("ccB", 20), unit("ccC", 3)];
        let groups = plan(Category::Textures, files, 10, "CCMerged");
        assert_eq!(sizes(&groups), vec![vec![3], vec![20], vec![3]]);
        assert_eq!(groups.iter().map(|g| g.oversized).collect::<Vec<_>>(), [false, true, false]);
    }

    #[test]
    fn empty_input_plans_nothing() {
        assert!(plan(Category::Audio, Vec::new(), 10, "CCMerged").is_empty());
    }

    proptest! {
        #[test]
        fn never_exceeds_ceiling_except_oversized(
            raw in prop::collection::vec(0u64..200, 0..40),
            ceiling in 1u64..300,
        ) {
            let files: Vec<SourceFile> = raw.iter().enumerate()
                .map(|(i, &s)| unit(&format!("cc{i:03}"), s))
                .collect();
            let count = files.len();
            let groups = plan(Category::Textures, files, ceiling, "CCMerged");
            let placed: usize = groups.iter().map(|g| g.files.len()).sum();
            prop_assert_eq!(placed, count);
            for g in &groups {
                prop_assert_eq!(g.size, g.files.iter().map(|f| f.size).sum::<u64>());
                if g.oversized {
                    prop_assert_eq!(g.files.len(), 1);
                    prop_assert!(g.size > ceiling);
                } else {
                    prop_assert!(g.size <= ceiling);
                }
            }
        }

        #[test]
        fn deterministic_regardless_of_input_order(
            raw in prop::collection::vec(0u64..100, 1..30),
            ceiling in 1u64..200,
            seed in any::<u64>(),
        ) {
            let files: Vec<SourceFile> = raw.iter().enumerate()
                .map(|(i, &s)| unit(&format!("cc{i:03}"), s))
                .collect();
            let mut shuffled = files.clone();
            let n = shuffled.len();
            shuffled.rotate_left((seed as usize) % n);
            shuffled.reverse();
            let a = plan(Category::Textures, files, ceiling, "CCMerged");
            let b = plan(Category::Textures, shuffled, ceiling, "CCMerged");
            prop_assert_eq!(a, b);
        }
    }
}
