mod common;

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use common::*;
use daq2arrow::{
    Checkpoint, ConversionConfig, ConversionError, Daq2Arrow, PacketSource, SourceFormat, StopReason, WriteMode,
};

#[tokio::test]
async fn test_streaming_file_end_to_end() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("run.dqs");
    let out = dir.path().join("out");
    std::fs::write(&input, streaming_bytes(7, 10))?;

    let mut source = Daq2Arrow::open(&input).await?;
    assert_eq!(source.metadata().format, SourceFormat::Streaming);
    assert_eq!(source.metadata().stream_id, Some(7));
    let mut frames = 0;
    while source.next_packet().await?.is_some() {
        frames += 1;
    }
    assert_eq!(frames, 13);

    let summary =
        Daq2Arrow::convert(&input.to_string_lossy(), &out, &ConversionConfig::default(), &CancellationToken::new())
            .await?;
    assert_eq!(summary.stop_reason, StopReason::EndOfStream);
    assert_eq!(summary.packets, 13);
    assert_eq!(summary.tables.get("stream_config"), Some(&1));
    assert_eq!(summary.tables.get("stream_events"), Some(&30));
    assert_eq!(summary.tables.get("stream_status"), Some(&2));
    assert_eq!(table_rows(&out, "stream_events")?, 30);

    let (schema, _) = daq2arrow::sink::read_table(&out.join("stream_events.arrow"))?;
    let waveform = schema.field("waveform").context("waveform column")?;
    assert_eq!(waveform.column_type, daq2arrow::ColumnType::Waveform { len: 6 });
    Ok(())
}

#[tokio::test]
async fn test_streaming_without_waveform_samples() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("run.dqs");
    let out = dir.path().join("out");
    std::fs::write(&input, streaming_bytes_with(2, 5, 0))?;

    let summary =
        Daq2Arrow::convert(&input.to_string_lossy(), &out, &ConversionConfig::default(), &CancellationToken::new())
            .await?;
    assert!(summary.is_clean());
    assert_eq!(summary.tables.get("stream_events"), Some(&15));
    assert_eq!(table_rows(&out, "stream_events")?, 15);

    let (schema, chunks) = daq2arrow::sink::read_table(&out.join("stream_events.arrow"))?;
    let waveform = schema.field("waveform").context("waveform column")?;
    assert_eq!(waveform.column_type, daq2arrow::ColumnType::Waveform { len: 0 });
    assert_eq!(chunks[0].column("waveform").map(|c| c.len()), Some(15));
    Ok(())
}

#[tokio::test]
async fn test_event_before_configuration_is_counted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("run.dqs");
    let out = dir.path().join("out");

    // Drop the configuration frame: the handshake is 16 bytes, the frame header 8
    let mut bytes = streaming_bytes(3, 2);
    let config_len = 8 + channel_map(3).encode().len();
    bytes.drain(16..16 + config_len);
    std::fs::write(&input, bytes)?;

    let summary =
        Daq2Arrow::convert(&input.to_string_lossy(), &out, &ConversionConfig::default(), &CancellationToken::new())
            .await?;
    assert_eq!(summary.counters.missing_configuration, 2);
    assert_eq!(summary.total_rows(), 0);
    Ok(())
}

#[tokio::test]
async fn test_streaming_resume_replays_configuration() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("run.dqs");
    std::fs::write(&input, streaming_bytes(9, 16))?;
    let name = input.to_string_lossy().into_owned();
    let config = ConversionConfig { buffer_size: 4, ..Default::default() };

    let full = dir.path().join("full");
    Daq2Arrow::convert(&name, &full, &config, &CancellationToken::new()).await?;

    let resumed = dir.path().join("resumed");
    let limited = ConversionConfig { max_packets: Some(7), ..config.clone() };
    Daq2Arrow::convert(&name, &resumed, &limited, &CancellationToken::new()).await?;
    let checkpoint = Checkpoint::load(&resumed)?.context("checkpoint")?;
    assert_eq!(checkpoint.format, SourceFormat::Streaming);
    assert_eq!(checkpoint.packets_read, 7);

    let resume = ConversionConfig { mode: WriteMode::Resume, ..config };
    let summary = Daq2Arrow::convert(&name, &resumed, &resume, &CancellationToken::new()).await?;
    assert_eq!(summary.counters.missing_configuration, 0);
    assert_eq!(summary.tables.get("stream_events"), Some(&48));

    assert_eq!(table_files(&resumed)?, table_files(&full)?);
    Ok(())
}

#[tokio::test]
async fn test_tcp_source_end_to_end() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let bytes = streaming_bytes(5, 8);

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await?;
        // Split writes so frames straddle reads
        for piece in bytes.chunks(37) {
            socket.write_all(piece).await?;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        socket.shutdown().await?;
        anyhow::Ok(())
    });

    let dir = tempfile::tempdir()?;
    let out = dir.path().join("out");
    let summary = Daq2Arrow::convert(
        &format!("tcp://{}", addr),
        &out,
        &ConversionConfig::default(),
        &CancellationToken::new(),
    )
    .await?;
    server.await??;

    assert_eq!(summary.stop_reason, StopReason::EndOfStream);
    assert_eq!(summary.tables.get("stream_events"), Some(&24));
    assert_eq!(table_rows(&out, "stream_status")?, 2);
    // Sockets cannot be resumed, so no checkpoint is left behind
    assert!(Checkpoint::load(&out)?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_tcp_cannot_resume() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let resume = ConversionConfig { mode: WriteMode::Resume, ..Default::default() };
    let err = Daq2Arrow::convert("tcp://127.0.0.1:9", dir.path(), &resume, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ConversionError::Config { .. }));
    Ok(())
}
