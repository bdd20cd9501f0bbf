mod common;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_array::cast::AsArray;
    use arrow_array::types::Float32Type;
    use deeptable::metrics::{BLOCKS_ALLOCATED, BLOCKS_RELEASED};
    use deeptable::{Deeptable, TileBufferManager};
    use deeptable_arena::{BufferArenaOptions, HostStore};

    use crate::common::{key, synthetic_tree};

    fn manager(table: &Deeptable, options: BufferArenaOptions) -> Arc<TileBufferManager<HostStore>> {
        table.buffer_manager(Arc::new(HostStore::default()), options)
    }

    fn small_buffers() -> BufferArenaOptions {
        BufferArenaOptions::default().with_buffer_size(1024).unwrap()
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_upload() {
        let tree = synthetic_tree(2);
        let table = tree.table();
        let buffers = manager(&table, small_buffers());
        let root = table.root();

        let first = buffers.ready_or_not_here_it_comes(&root, "x");
        let second = buffers.ready_or_not_here_it_comes(&root, "x");
        assert_eq!(buffers.pending_jobs(), 1);
        assert!(!buffers.ready(root.id(), "x"));

        assert_eq!(buffers.run_pending().await, 1);
        let (first, second) = (first.await.unwrap(), second.await.unwrap());
        assert!(first.same_block(&second));
        assert!(buffers.ready(root.id(), "x"));
        assert_eq!(first.item_count(), 10);
        assert_eq!(first.stride, 4);

        let again = buffers.ready_or_not_here_it_comes(&root, "x").await.unwrap();
        assert!(again.same_block(&first));
        assert_eq!(buffers.pending_jobs(), 0);
        assert_eq!(table.metrics().count(BLOCKS_ALLOCATED), 1);
    }

    #[tokio::test]
    async fn staged_bytes_are_little_endian_f32() {
        let tree = synthetic_tree(2);
        let table = tree.table();
        let buffers = manager(&table, small_buffers());
        let root = table.root();

        let pending = buffers.ready_or_not_here_it_comes(&root, "x");
        buffers.run_pending().await;
        let location = pending.await.unwrap();

        let x = root.column("x").unwrap();
        let expected: Vec<u8> = x
            .as_primitive::<Float32Type>()
            .values()
            .iter()
            .flat_map(|value| value.to_le_bytes())
            .collect();
        let staged = location
            .buffer
            .read(location.offset, location.byte_size)
            .unwrap();
        assert_eq!(staged.as_ref(), expected.as_slice());
        assert_eq!(buffers.location(root.id(), "x").unwrap().offset, location.offset);
    }

    #[tokio::test]
    async fn derived_columns_are_evaluated_before_staging() {
        let tree = synthetic_tree(2);
        let table = tree.table();
        table
            .register_row_transformation("ix_plus_one", |row| row[0] + 1.0, vec!["ix".into()])
            .unwrap();
        let buffers = manager(&table, small_buffers());
        let root = table.root();

        let pending = buffers.ready_or_not_here_it_comes(&root, "ix_plus_one");
        buffers.run_pending().await;
        let location = pending.await.unwrap();

        let staged = location
            .buffer
            .read(location.offset, location.byte_size)
            .unwrap();
        let values: Vec<f32> = staged
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        assert_eq!(values, (1..=10u8).map(f32::from).collect::<Vec<_>>());
        assert!(root.has_column("ix_plus_one"));
    }

    #[tokio::test]
    async fn released_blocks_are_reused() {
        let tree = synthetic_tree(2);
        let table = tree.table();
        let buffers = manager(&table, small_buffers());
        let root = table.root();

        let x = buffers.ready_or_not_here_it_comes(&root, "x");
        let y = buffers.ready_or_not_here_it_comes(&root, "y");
        assert_eq!(buffers.run_pending().await, 2);
        let (x, y) = (x.await.unwrap(), y.await.unwrap());
        assert!(!x.same_block(&y));
        assert_eq!(buffers.stats().staged_columns, 2);

        assert_eq!(buffers.release_tile(root.id()), 2);
        assert!(!buffers.release(root.id(), "x"));
        let stats = buffers.stats();
        assert_eq!(stats.staged_columns, 0);
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(stats.free_bytes, 80);
        assert_eq!(stats.buffer_count, 1);

        let child = root.children()[0].clone();
        assert_eq!(child.key(), key("1/0/0"));
        let reused = buffers.ready_or_not_here_it_comes(&child, "x");
        buffers.run_pending().await;
        let reused = reused.await.unwrap();
        assert!(reused.same_block(&x) || reused.same_block(&y));
        assert_eq!(buffers.stats().free_blocks, 1);
        assert_eq!(table.metrics().count(BLOCKS_ALLOCATED), 3);
        assert_eq!(table.metrics().count(BLOCKS_RELEASED), 2);
    }

    #[tokio::test]
    async fn failed_staging_can_be_retried() {
        let tree = synthetic_tree(2);
        let table = tree.table();
        let buffers = manager(&table, small_buffers());
        let root = table.root();

        let missing = buffers.ready_or_not_here_it_comes(&root, "nope");
        buffers.run_pending().await;
        assert!(missing.await.unwrap_err().is_column_not_found());
        assert!(!buffers.ready(root.id(), "nope"));

        let _retry = buffers.ready_or_not_here_it_comes(&root, "nope");
        assert_eq!(buffers.pending_jobs(), 1);
        assert_eq!(table.metrics().count(BLOCKS_ALLOCATED), 0);
    }

    #[tokio::test]
    async fn bounded_arenas_refuse_to_grow() {
        let tree = synthetic_tree(2);
        let table = tree.table();
        let buffers = manager(
            &table,
            BufferArenaOptions::default()
                .with_buffer_size(64)
                .unwrap()
                .with_max_buffers(1),
        );
        let root = table.root();

        let x = buffers.ready_or_not_here_it_comes(&root, "x");
        let y = buffers.ready_or_not_here_it_comes(&root, "y");
        buffers.run_pending().await;
        assert!(x.await.is_ok());
        assert!(y.await.is_err());
        assert!(buffers.ready(root.id(), "x"));
        assert!(!buffers.ready(root.id(), "y"));
        assert_eq!(buffers.stats().buffer_count, 1);
    }
}
