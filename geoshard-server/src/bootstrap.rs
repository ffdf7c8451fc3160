use geoshard_core::reconcile::{PeerTable, ShardTable, SyncedTable};
use geoshard_core::{
    ClusterTransport, PeerAnnouncement, PeerDirectory, PeerRecord, Result, ShardDirectory,
    TopologyLock,
};
use std::sync::Arc;

/// Joins an existing network through `seed`: copies the seed's shard and
/// peer tables, then announces this node so the seed can spread the word.
pub async fn join_network(
    seed: &str,
    directory: Arc<dyn ShardDirectory>,
    lock: TopologyLock,
    peers: Arc<PeerDirectory>,
    transport: &dyn ClusterTransport,
) -> Result<()> {
    let shard_table = ShardTable::new(directory, lock);
    let peer_table = PeerTable::new(peers.clone());

    for table in [&shard_table as &dyn SyncedTable, &peer_table] {
        let rows = transport.fetch_table(seed, table.retrieval_path()).await?;
        let count = rows.len();
        table.replace(rows).await?;
        tracing::info!("Loaded {} {} row(s) from seed {}", count, table.name(), seed);
    }

    peers.add(seed).await?;

    let announcement = PeerAnnouncement {
        peer: PeerRecord {
            base_addr: peers.local_addr().to_string(),
        },
        forwarded: false,
    };
    transport.announce_peer(seed, &announcement).await?;

    tracing::info!(
        "Joined network through {} with {} peer(s)",
        seed,
        peers.list().await.len()
    );
    Ok(())
}
