//! Flex framing and transform swaps end to end.

use std::sync::Arc;

use skein_client::ClientConfig;
use skein_core::{
    TransformChain,
    transform::{Compressor, FlexOptions, XorCipher},
};
use skein_harness::{Down, Lobby, Up, loopback};
use skein_proto::{Codec, Result};

/// Reverses the payload. Enough to prove the hook runs on both ends.
#[derive(Debug)]
struct Reverse;

impl Compressor for Reverse {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.iter().rev().copied().collect())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.iter().rev().copied().collect())
    }
}

fn flex_chain(codec: Codec, compress: bool, encrypt: bool) -> TransformChain {
    let options = FlexOptions::new(compress, encrypt)
        .with_compressor(Arc::new(Reverse))
        .with_cipher(Arc::new(XorCipher::new(*b"skein").unwrap()));
    TransformChain::new(codec).with_flex(options)
}

#[tokio::test]
async fn compressed_and_encrypted_frames_round_trip() {
    let mut config = loopback();
    config.transform = flex_chain(Codec::Cbor, true, true);
    let mut lobby = Lobby::open(config).await.unwrap();

    let client_config = ClientConfig { transform: flex_chain(Codec::Cbor, true, true), ..ClientConfig::default() };
    let mut member = lobby.join(client_config).await.unwrap();

    member.client.send_message(&Up::Say("sealed".into())).await;
    assert_eq!(lobby.next_message().await, Some((member.id, Up::Say("sealed".into()))));

    lobby.server.broadcast(&Down::Pong(11)).await;
    assert_eq!(member.next_message().await, Some(Down::Pong(11)));

    lobby.server.close().await;
}

#[tokio::test]
async fn receiver_follows_the_senders_flags() {
    // Only the client compresses; the server only encrypts. Each side reads
    // the control byte, so both directions still decode.
    let mut config = loopback();
    config.transform = flex_chain(Codec::Json, false, true);
    let mut lobby = Lobby::open(config).await.unwrap();

    let client_config = ClientConfig { transform: flex_chain(Codec::Json, true, false), ..ClientConfig::default() };
    let mut member = lobby.join(client_config).await.unwrap();

    member.client.send_message(&Up::Ping(1)).await;
    assert_eq!(lobby.next_message().await, Some((member.id, Up::Ping(1))));

    lobby.server.send_message(&Down::Pong(1), &[member.id]).await;
    assert_eq!(member.next_message().await, Some(Down::Pong(1)));

    lobby.server.close().await;
}

#[tokio::test]
async fn swapping_transforms_on_both_ends_keeps_the_session() {
    let mut lobby = Lobby::open(loopback()).await.unwrap();
    let mut member = lobby.join(ClientConfig::default()).await.unwrap();

    member.client.send_message(&Up::Say("cbor".into())).await;
    assert_eq!(lobby.next_message().await, Some((member.id, Up::Say("cbor".into()))));

    lobby.server.set_transform(flex_chain(Codec::Json, true, true));
    member.client.set_transform(flex_chain(Codec::Json, true, true));
    assert_eq!(lobby.server.transform().codec(), Codec::Json);
    assert!(member.client.transform().is_flex());

    member.client.send_message(&Up::Say("json".into())).await;
    assert_eq!(lobby.next_message().await, Some((member.id, Up::Say("json".into()))));
    lobby.server.broadcast(&Down::Pong(2)).await;
    assert_eq!(member.next_message().await, Some(Down::Pong(2)));

    lobby.server.close().await;
}

#[tokio::test]
async fn mismatched_codec_frames_are_skipped_not_fatal() {
    let mut lobby = Lobby::open(loopback()).await.unwrap();
    let member = lobby.join(ClientConfig::default()).await.unwrap();

    member.client.set_transform(TransformChain::new(Codec::Json));
    member.client.send_message(&Up::Say("lost".into())).await;
    member.client.set_transform(TransformChain::new(Codec::Cbor));
    member.client.send_message(&Up::Say("kept".into())).await;

    assert_eq!(lobby.next_message().await, Some((member.id, Up::Say("kept".into()))));
    assert!(lobby.server.is_registered(member.id));
    assert!(member.client.is_connected());

    lobby.server.close().await;
}
