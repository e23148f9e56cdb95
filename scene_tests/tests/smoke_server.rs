use scene_server::server::bind_ephemeral;
use scene_shared::scene::BoxSpec;

/// Smoke test: server can run a few ticks without panicking.
#[tokio::test]
async fn server_runs_few_ticks() -> anyhow::Result<()> {
    let (mut server, _cfg) = bind_ephemeral(64).await?;
    server.scene().create_box("b1", BoxSpec::default())?;
    server.run_for_ticks(3).await?;
    assert_eq!(server.tick(), 3);
    assert_eq!(server.scene().object_count(), 1);
    Ok(())
}
