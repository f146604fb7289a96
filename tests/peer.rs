use std::time::Duration;

use rust_torrent::{error::Error, ClientConfig, PeerState, Torrent};

mod common;
use common::{
    connection, ready_connection, test_config, Faults, Fixture, SEEDER_ID, SEEDER_METADATA_ID,
};

#[tokio::test]
async fn setup_reaches_unchoked() -> Result<(), Error> {
    let fixture = Fixture::new(10_000, 4096);
    let config = test_config();
    let faults = Faults {
        extensions: true,
        ..Faults::default()
    };

    let conn = ready_connection(&fixture, faults, 1, &config).await?;

    assert_eq!(conn.state(), PeerState::Unchoked);
    assert_eq!(conn.remote_peer_id(), Some(SEEDER_ID));
    assert_eq!(conn.bitfield(), Some(&[0xff][..]));
    assert!(conn.extensions_enabled());
    assert_eq!(conn.metadata_id(), Some(SEEDER_METADATA_ID));
    assert_eq!(conn.metadata_size(), Some(fixture.info.len()));
    Ok(())
}

#[tokio::test]
async fn extension_handshake_before_bitfield_is_kept() -> Result<(), Error> {
    let fixture = Fixture::new(10_000, 4096);
    let config = test_config();
    let faults = Faults {
        extensions: true,
        extensions_first: true,
        ..Faults::default()
    };

    let conn = ready_connection(&fixture, faults, 1, &config).await?;
    assert_eq!(conn.state(), PeerState::Unchoked);
    assert_eq!(conn.metadata_id(), Some(SEEDER_METADATA_ID));
    Ok(())
}

#[tokio::test]
async fn extensions_need_both_sides() -> Result<(), Error> {
    let fixture = Fixture::new(10_000, 4096);

    // seeder without the extension bit
    let config = test_config();
    let conn = ready_connection(&fixture, Faults::default(), 1, &config).await?;
    assert!(!conn.extensions_enabled());
    assert_eq!(conn.metadata_id(), None);

    // client without the extension bit
    let config = ClientConfig {
        extensions: false,
        ..test_config()
    };
    let faults = Faults {
        extensions: true,
        ..Faults::default()
    };
    let conn = ready_connection(&fixture, faults, 2, &config).await?;
    assert_eq!(conn.state(), PeerState::Unchoked);
    assert!(!conn.extensions_enabled());
    Ok(())
}

#[tokio::test]
async fn malformed_have_before_bitfield_is_dropped() -> Result<(), Error> {
    let fixture = Fixture::new(10_000, 4096);
    let config = test_config();
    let faults = Faults {
        short_have_first: true,
        ..Faults::default()
    };

    let mut conn = ready_connection(&fixture, faults, 1, &config).await?;
    assert_eq!(conn.state(), PeerState::Unchoked);
    assert_eq!(conn.bitfield(), Some(&[0xff][..]));

    let work = fixture.torrent.piece_work(0).expect("piece in range");
    assert_eq!(conn.download_piece(&work).await?, fixture.piece(0));
    Ok(())
}

#[tokio::test]
async fn garbled_extension_handshake_is_dropped_without_extensions() -> Result<(), Error> {
    let fixture = Fixture::new(10_000, 4096);
    let config = ClientConfig {
        extensions: false,
        ..test_config()
    };
    let faults = Faults {
        extensions: true,
        garbled_extensions_first: true,
        ..Faults::default()
    };

    let conn = ready_connection(&fixture, faults, 1, &config).await?;
    assert_eq!(conn.state(), PeerState::Unchoked);
    assert!(!conn.extensions_enabled());
    Ok(())
}

#[tokio::test]
async fn wrong_extension_reply_fails_setup() {
    let fixture = Fixture::new(10_000, 4096);
    let config = test_config();
    let faults = Faults {
        extensions: true,
        wrong_extension_reply: true,
        ..Faults::default()
    };

    let mut conn = connection(&fixture, faults, 1, &config);
    let result = conn.setup(fixture.info_hash(), &config).await;

    assert!(matches!(result, Err(Error::Protocol(_))));
    assert_eq!(conn.state(), PeerState::Failed);
}

#[tokio::test]
async fn wrong_info_hash_fails_setup() {
    let fixture = Fixture::new(10_000, 4096);
    let config = test_config();
    let faults = Faults {
        wrong_info_hash: true,
        ..Faults::default()
    };

    let mut conn = connection(&fixture, faults, 1, &config);
    let result = conn.setup(fixture.info_hash(), &config).await;

    assert!(matches!(result, Err(Error::Protocol(_))));
    assert_eq!(conn.state(), PeerState::Failed);
}

#[tokio::test]
async fn silent_peer_times_out_during_setup() {
    let fixture = Fixture::new(10_000, 4096);
    let config = ClientConfig {
        io_timeout: Some(Duration::from_millis(50)),
        ..test_config()
    };
    let faults = Faults {
        silent: true,
        ..Faults::default()
    };

    let mut conn = connection(&fixture, faults, 1, &config);
    let result = conn.setup(fixture.info_hash(), &config).await;

    assert!(matches!(result, Err(Error::Timeout)));
    assert_eq!(conn.state(), PeerState::Failed);
}

#[tokio::test]
async fn downloads_and_verifies_a_piece() -> Result<(), Error> {
    let fixture = Fixture::new(10_000, 4096);
    let config = test_config();
    let mut conn = ready_connection(&fixture, Faults::default(), 1, &config).await?;

    // the last piece is 10_000 - 2 * 4096 bytes, a partial final block
    for index in [2, 0] {
        let work = fixture.torrent.piece_work(index).expect("piece in range");
        let data = conn.download_piece(&work).await?;
        assert_eq!(data, fixture.piece(index));
    }
    Ok(())
}

#[tokio::test]
async fn unrelated_message_mid_piece_is_a_violation() -> Result<(), Error> {
    let fixture = Fixture::new(10_000, 4096);
    let config = test_config();
    let faults = Faults {
        interject_have: true,
        ..Faults::default()
    };
    let mut conn = ready_connection(&fixture, faults, 1, &config).await?;

    let work = fixture.torrent.piece_work(0).expect("piece in range");
    assert!(matches!(
        conn.download_piece(&work).await,
        Err(Error::Protocol(_))
    ));

    // the replies still in flight must not leak into the next piece
    for index in [1, 0] {
        let work = fixture.torrent.piece_work(index).expect("piece in range");
        assert_eq!(conn.download_piece(&work).await?, fixture.piece(index));
    }
    Ok(())
}

#[tokio::test]
async fn corrupted_piece_fails_verification_then_recovers() -> Result<(), Error> {
    let fixture = Fixture::new(10_000, 4096);
    let config = test_config();
    let faults = Faults {
        corrupt_once: Some(1),
        ..Faults::default()
    };
    let mut conn = ready_connection(&fixture, faults, 1, &config).await?;
    let work = fixture.torrent.piece_work(1).expect("piece in range");

    assert!(matches!(
        conn.download_piece(&work).await,
        Err(Error::Verification { index: 1, .. })
    ));
    assert_eq!(conn.download_piece(&work).await?, fixture.piece(1));
    Ok(())
}

#[tokio::test]
async fn fetches_metadata_over_several_pieces() -> Result<(), Error> {
    // 1000 piece hashes push the info dict past one 16 KiB metadata piece
    let fixture = Fixture::new(64_000, 64);
    assert!(fixture.info.len() > 16 * 1024);

    let config = test_config();
    let faults = Faults {
        extensions: true,
        ..Faults::default()
    };
    let mut conn = ready_connection(&fixture, faults, 1, &config).await?;

    let info = conn.fetch_metadata(&fixture.info_hash()).await?;
    assert_eq!(info, fixture.info);

    let torrent = Torrent::from_info(&info, common::ANNOUNCE)?;
    assert_eq!(torrent, fixture.torrent);
    Ok(())
}

#[tokio::test]
async fn metadata_with_the_wrong_hash_is_refused() -> Result<(), Error> {
    let fixture = Fixture::new(10_000, 4096);
    let config = test_config();
    let faults = Faults {
        extensions: true,
        ..Faults::default()
    };
    let mut conn = ready_connection(&fixture, faults, 1, &config).await?;

    assert!(matches!(
        conn.fetch_metadata(&[0x42; 20]).await,
        Err(Error::Metadata(_))
    ));
    Ok(())
}

#[tokio::test]
async fn rejected_metadata_request_is_an_error() -> Result<(), Error> {
    let fixture = Fixture::new(10_000, 4096);
    let config = test_config();
    let faults = Faults {
        extensions: true,
        reject_metadata: true,
        ..Faults::default()
    };
    let mut conn = ready_connection(&fixture, faults, 1, &config).await?;

    assert!(matches!(
        conn.fetch_metadata(&fixture.info_hash()).await,
        Err(Error::Metadata(_))
    ));
    Ok(())
}

#[tokio::test]
async fn metadata_needs_the_extension() -> Result<(), Error> {
    let fixture = Fixture::new(10_000, 4096);
    let config = test_config();
    let mut conn = ready_connection(&fixture, Faults::default(), 1, &config).await?;

    assert!(matches!(
        conn.fetch_metadata(&fixture.info_hash()).await,
        Err(Error::Metadata(_))
    ));
    Ok(())
}
