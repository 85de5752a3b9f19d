//! Selection Primitives
//!
//! In-place partitioning helpers used by the budget partitioner. The
//! central one is [`quick_select_sum`]: a quickselect that, instead of
//! finding the k-th element, finds how many of the smallest elements fit
//! into a byte budget.

/// Order `table[a]`, `table[b]`, `table[c]` so the median lands on `b`
pub fn median_of_3<T, L>(table: &mut [T], a: usize, b: usize, c: usize, less: &L)
where
    L: Fn(&T, &T) -> bool,
{
    if less(&table[b], &table[a]) {
        table.swap(a, b);
    }
    if less(&table[c], &table[b]) {
        table.swap(b, c);
        if less(&table[b], &table[a]) {
            table.swap(a, b);
        }
    }
}

/// Move a pivot estimate to `m`: median of three for short ranges,
/// pseudo-median of nine once the range spans 40 or more elements
pub fn median<T, L>(table: &mut [T], a: usize, m: usize, b: usize, less: &L)
where
    L: Fn(&T, &T) -> bool,
{
    if b - a >= 40 {
        let step = (b - a + 1) / 8;
        median_of_3(table, a, a + step, a + 2 * step, less);
        median_of_3(table, m - step, m, m + step, less);
        median_of_3(table, b - 2 * step, b - step, b, less);
        median_of_3(table, a + step, m, b - step, less);
    } else {
        median_of_3(table, a, m, b, less);
    }
}

/// Rearrange `table` so that a prefix of its smallest elements (by `less`)
/// fits into `target`, and return the prefix length
///
/// Elements before the returned index all order before the elements after
/// it. An element is kept when its size is at most the budget left after
/// the smaller elements, so a budget of `k * s` over elements of size `s`
/// keeps exactly `k`.
pub fn quick_select_sum<T, L, S>(table: &mut [T], mut target: isize, less: L, size: S) -> usize
where
    L: Fn(&T, &T) -> bool,
    S: Fn(&T) -> usize,
{
    if table.is_empty() {
        return 0;
    }

    let mut range_min = 0;
    let mut range_max = table.len();

    loop {
        let pivot_idx = range_min + (range_max - range_min) / 2;
        median(table, range_min, pivot_idx, range_max - 1, &less);

        // Park the pivot at the end of the range while partitioning
        let pivot = range_max - 1;
        table.swap(pivot, pivot_idx);

        let mut left_sum: isize = 0;
        let mut left = range_min;
        let mut right = pivot;
        while left < right {
            while left < right && !less(&table[pivot], &table[left]) {
                left_sum += size(&table[left]) as isize;
                left += 1;
            }
            while right > left && !less(&table[right - 1], &table[pivot]) {
                right -= 1;
            }
            if right > left {
                table.swap(left, right - 1);
            }
        }
        table.swap(pivot, left);

        if left_sum >= target {
            range_max = left;
        } else {
            range_min = left;
            target -= left_sum;
        }

        // One candidate left: keep it only if it fits what remains
        if range_max - range_min <= 1 {
            if range_max > range_min && (size(&table[range_min]) as isize) <= target {
                return range_max;
            }
            return range_min;
        }
    }
}

/// Move every element matching `pred` to the front, returning how many
/// matched
pub fn partition<T, P>(table: &mut [T], pred: P) -> usize
where
    P: Fn(&T) -> bool,
{
    let mut first = 0;
    for index in 0..table.len() {
        if pred(&table[index]) {
            table.swap(first, index);
            first += 1;
        }
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lt(a: &u32, b: &u32) -> bool {
        a < b
    }

    fn assert_split(table: &[u32], split: usize) {
        if split == 0 || split == table.len() {
            return;
        }
        let max_left = table[..split].iter().max().unwrap();
        let min_right = table[split..].iter().min().unwrap();
        assert!(max_left <= min_right, "{:?} split at {}", table, split);
    }

    #[test]
    fn test_median_of_3() {
        let mut table = [3, 1, 2];
        median_of_3(&mut table, 0, 1, 2, &lt);
        assert_eq!(table, [1, 2, 3]);

        let mut table = [5, 9, 1];
        median_of_3(&mut table, 0, 1, 2, &lt);
        assert_eq!(table[1], 5);
    }

    #[test]
    fn test_median_of_nine_places_pivot() {
        let mut table: Vec<u32> = (0..64).rev().collect();
        median(&mut table, 0, 32, 63, &lt);
        // The estimate is bracketed by the outer samples
        assert!(table[32] > 0 && table[32] < 63);
    }

    #[test]
    fn test_equal_sizes_fill_exactly() {
        let mut table: Vec<u32> = (0..100).map(|i| (i * 37) % 100).collect();
        let split = quick_select_sum(&mut table, 50, lt, |_| 1);
        assert_eq!(split, 50);
        assert_split(&table, split);
        let mut prefix = table[..split].to_vec();
        prefix.sort();
        assert_eq!(prefix, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_budget_fits_everything() {
        let mut table: Vec<u32> = (0..20).rev().collect();
        assert_eq!(quick_select_sum(&mut table, 1000, lt, |_| 10), 20);
    }

    #[test]
    fn test_zero_budget() {
        let mut table: Vec<u32> = (0..20).collect();
        assert_eq!(quick_select_sum(&mut table, 0, lt, |_| 10), 0);
    }

    #[test]
    fn test_weighted_split() {
        // Sizes equal to values: 1+2+3+4 = 10 fits, adding 5 does not
        let mut table: Vec<u32> = vec![7, 3, 9, 1, 5, 2, 8, 4, 6, 10];
        let split = quick_select_sum(&mut table, 12, lt, |v| *v as usize);
        assert_split(&table, split);
        let sum: u32 = table[..split].iter().sum();
        assert!(split == 4 || split == 5, "split {}", split);
        assert!(sum <= 12 + 5);
    }

    #[test]
    fn test_large_range_uses_ninther() {
        let mut table: Vec<u32> = (0..1000).map(|i| (i * 7919) % 1000).collect();
        let split = quick_select_sum(&mut table, 250 * 4, lt, |_| 4);
        assert_eq!(split, 250);
        assert_split(&table, split);
    }

    #[test]
    fn test_partition() {
        let mut table = [1, 8, 3, 6, 5, 4];
        let count = partition(&mut table, |v| v % 2 == 0);
        assert_eq!(count, 3);
        assert!(table[..3].iter().all(|v| v % 2 == 0));
        assert!(table[3..].iter().all(|v| v % 2 == 1));
    }
}
