//! Data-parallel helpers for the per-entity and per-bucket stages.

/// Map `f` over `items` on up to `workers` scoped threads. Output order
/// matches input order, so results are identical to the serial path.
pub fn par_map<T, R, F>(items: &[T], workers: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    if workers <= 1 || items.len() < 2 {
        return items.iter().map(&f).collect();
    }
    let chunk = items.len().div_ceil(workers);
    let f = &f;
    std::thread::scope(|scope| {
        let handles: Vec<_> = items
            .chunks(chunk)
            .map(|part| scope.spawn(move || part.iter().map(f).collect::<Vec<R>>()))
            .collect();
        handles
            .into_iter()
            .flat_map(|h| match h.join() {
                Ok(v) => v,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_order_across_workers() {
        let items: Vec<u32> = (0..1000).collect();
        let serial = par_map(&items, 1, |x| x * 2);
        let parallel = par_map(&items, 8, |x| x * 2);
        assert_eq!(serial, parallel);
        assert_eq!(parallel[999], 1998);
    }

    #[test]
    fn empty_input() {
        let items: Vec<u32> = Vec::new();
        assert!(par_map(&items, 4, |x| *x).is_empty());
    }
}
