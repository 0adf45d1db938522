//! Production integration tests for the cache
//!
//! These tests verify real-world usage scenarios across allocator, index,
//! persistence and eviction using LruCache directly

#[cfg(test)]
mod integration {
    use crate::cache::{ContentHash, LruCache, PAGE_SIZE};
    use std::path::PathBuf;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gencache_prod_{}_{}", name, uuid::Uuid::new_v4()))
    }

    fn blob(i: usize, len: usize) -> Vec<u8> {
        let mut data = format!("blob:{}:", i).into_bytes();
        data.resize(len, (i % 251) as u8);
        data
    }

    #[test]
    fn test_production_save_and_reload() -> crate::error::Result<()> {
        let temp_dir = temp_dir("reload");
        let index = temp_dir.join("cache.idx");
        let data = temp_dir.join("cache.dat");

        let blobs: Vec<_> = (0..300).map(|i| blob(i, 17 + i * 61)).collect();

        // Phase 1: populate across several generations
        let stats = {
            let cache = LruCache::create_new(&index, &data, 1000, 64 << 20)?;
            for (i, b) in blobs.iter().enumerate() {
                cache.add(&ContentHash::compute(b), b);
                if i % 50 == 49 {
                    cache.next_generation();
                }
            }
            cache.save()?;
            cache.stats()
        };

        // Phase 2: everything comes back identical
        let cache = LruCache::open(&index, &data)?;
        assert_eq!(cache.stats(), stats);
        let view = cache.lock_view();
        for b in &blobs {
            let got = view.get(&ContentHash::compute(b)).expect("blob should survive reload");
            assert_eq!(got.as_ref(), b.as_slice());
        }
        drop(view);

        // Allocation after reload reuses partial pages instead of leaking them
        let before = cache.stats().num_free_pages;
        cache.add(&ContentHash::compute(b"tiny"), b"tiny");
        assert_eq!(cache.stats().num_free_pages, before);

        std::fs::remove_dir_all(temp_dir).ok();
        Ok(())
    }

    #[test]
    fn test_production_capacity_bound() -> crate::error::Result<()> {
        let temp_dir = temp_dir("capacity");
        let cache = LruCache::create_new(temp_dir.join("c.idx"), temp_dir.join("c.dat"), 25, 1 << 20)?;

        let mut stored = 0;
        for i in 0..100 {
            if cache.add(&ContentHash::compute(&blob(i, 10)), &blob(i, 10)) {
                stored += 1;
            }
        }
        assert_eq!(stored, 25);
        assert_eq!(cache.len(), 25);
        assert_eq!(cache.stats().num_bytes, 250);

        std::fs::remove_dir_all(temp_dir).ok();
        Ok(())
    }

    #[test]
    fn test_production_page_growth() -> crate::error::Result<()> {
        let temp_dir = temp_dir("growth");
        let cache = LruCache::create_new(temp_dir.join("c.idx"), temp_dir.join("c.dat"), 100, 1 << 20)?;

        // Four 1 KB blocks fill a page; the fifth opens a second one
        for i in 0..5u64 {
            let data = blob(i as usize, 1000);
            assert!(cache.add(&ContentHash::compute(&data), &data));

            let stats = cache.stats();
            assert_eq!(stats.num_bytes, 1000 * (i + 1));
            assert_eq!(stats.num_bytes_with_block_slack, 1024 * (i + 1));
            let pages = if i < 4 { 1 } else { 2 };
            assert_eq!(stats.num_bytes_with_page_slack, pages * PAGE_SIZE as u64, "insert {}", i + 1);
        }

        std::fs::remove_dir_all(temp_dir).ok();
        Ok(())
    }

    #[test]
    fn test_production_trim_keeps_recent_reads() -> crate::error::Result<()> {
        let temp_dir = temp_dir("recent");
        let cache = LruCache::create_new(temp_dir.join("c.idx"), temp_dir.join("c.dat"), 500, 16 << 20)?;

        let old: Vec<_> = (0..100).map(|i| blob(i, 500)).collect();
        for b in &old {
            cache.add(&ContentHash::compute(b), b);
        }
        cache.next_generation();

        // Reading moves an object into the current generation
        let hot = &old[7];
        {
            let view = cache.lock_view();
            assert!(view.get(&ContentHash::compute(hot)).is_some());
        }

        assert!(cache.trim(1000)?);
        assert!(cache.contains(&ContentHash::compute(hot)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().num_bytes, 500);

        // The trimmed state is what reopening sees
        drop(cache);
        let cache = LruCache::open(temp_dir.join("c.idx"), temp_dir.join("c.dat"))?;
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().num_free_pages, (16 << 20) / PAGE_SIZE - 1);

        std::fs::remove_dir_all(temp_dir).ok();
        Ok(())
    }

    #[test]
    fn test_production_freed_space_is_reused() -> crate::error::Result<()> {
        let temp_dir = temp_dir("reuse");
        let cache = LruCache::create_new(temp_dir.join("c.idx"), temp_dir.join("c.dat"), 100, 8 * PAGE_SIZE as u64)?;

        for round in 0..10 {
            for i in 0..3 {
                let b = blob(round * 10 + i, 2 * PAGE_SIZE + 100);
                assert!(cache.add(&ContentHash::compute(&b), &b), "round {} blob {}", round, i);
            }
            cache.next_generation();
            assert!(cache.trim(0)?);
            assert_eq!(cache.stats().num_free_pages, 8);
        }

        std::fs::remove_dir_all(temp_dir).ok();
        Ok(())
    }
}
