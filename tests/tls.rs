/*
 * smtpd - embeddable SMTP receiving server
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

//! TLS tests: an implicit-TLS listener and a mid-stream STARTTLS upgrade,
//! both driven by a raw rustls client over a real socket.

use smtpd::{rustls, CancellationToken, Listener, ListenerMode, Message, ServeMux, Server};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

struct NoVerify;

impl rustls::client::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

fn server_tls_config() -> Arc<rustls::ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    Arc::new(
        rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                vec![rustls::Certificate(cert.serialize_der().unwrap())],
                rustls::PrivateKey(cert.serialize_private_key_der()),
            )
            .unwrap(),
    )
}

fn client_connector() -> tokio_rustls::TlsConnector {
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

/// Read one possibly multi-line SMTP reply.
async fn read_reply<S: tokio::io::AsyncBufRead + Unpin>(stream: &mut S) -> String {
    let mut reply = String::new();
    loop {
        let mut line = String::new();
        let read = stream.read_line(&mut line).await.unwrap();
        assert!(read > 0, "connection closed mid-reply: {reply:?}");
        reply.push_str(&line);
        if line.len() >= 4 && line.as_bytes()[3] == b' ' {
            return reply;
        }
    }
}

async fn start_server(
    port: &str,
    mode: ListenerMode,
) -> (CancellationToken, Arc<Mutex<Vec<Message>>>) {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let mux = Arc::new(ServeMux::new());
    let sink = Arc::clone(&captured);
    mux.handle_fn(move |message| {
        sink.lock().unwrap().push(message.clone());
        Ok(())
    })
    .await;

    let server = Server::builder()
        .listener(
            Listener::builder()
                .id(mode.to_string())
                .port(port)
                .mode(mode)
                .tls_config(server_tls_config())
                .handler(mux)
                .build()
                .unwrap(),
        )
        .idle_timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    let shutdown = CancellationToken::new();
    tokio::spawn(server.listen_and_serve(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(250)).await;
    (shutdown, captured)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn implicit_tls_session() {
    let (shutdown, captured) = start_server("12465", ListenerMode::Tls).await;

    let tcp = tokio::net::TcpStream::connect("127.0.0.1:12465")
        .await
        .unwrap();
    let tls = client_connector()
        .connect(rustls::ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();
    let mut stream = BufReader::new(tls);

    assert!(read_reply(&mut stream).await.starts_with("220 "));

    stream.write_all(b"EHLO client.example\r\n").await.unwrap();
    let capabilities = read_reply(&mut stream).await;
    assert!(!capabilities.contains("STARTTLS"));

    // STARTTLS inside an already-encrypted session is not a command
    stream.write_all(b"STARTTLS\r\n").await.unwrap();
    assert_eq!(read_reply(&mut stream).await, "500 unrecognized command\r\n");

    stream.write_all(b"MAIL FROM:<a@b.example>\r\n").await.unwrap();
    assert_eq!(read_reply(&mut stream).await, "250 Ok\r\n");
    stream.write_all(b"RCPT TO:<c@d.example>\r\n").await.unwrap();
    assert_eq!(read_reply(&mut stream).await, "250 Ok\r\n");
    stream.write_all(b"DATA\r\n").await.unwrap();
    assert!(read_reply(&mut stream).await.starts_with("354 "));
    stream
        .write_all(b"Subject: secret\r\n\r\nencrypted hello\r\n.\r\n")
        .await
        .unwrap();
    assert!(read_reply(&mut stream).await.contains("queued as +"));
    stream.write_all(b"QUIT\r\n").await.unwrap();
    assert_eq!(read_reply(&mut stream).await, "221 Bye\r\n");

    shutdown.cancel();

    let messages = captured.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].helo_domain, "client.example");
    assert_eq!(messages[0].headers.get("subject").unwrap(), ["secret"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn starttls_upgrade_clears_envelope_state() {
    let (shutdown, captured) = start_server("12587", ListenerMode::StartTls).await;

    let tcp = tokio::net::TcpStream::connect("127.0.0.1:12587")
        .await
        .unwrap();
    let mut stream = BufReader::new(tcp);

    assert!(read_reply(&mut stream).await.starts_with("220 "));

    stream.write_all(b"EHLO before.example\r\n").await.unwrap();
    let capabilities = read_reply(&mut stream).await;
    assert!(capabilities.contains("250-STARTTLS\r\n"));

    // open an envelope that the upgrade must discard
    stream
        .write_all(b"MAIL FROM:<old@before.example>\r\n")
        .await
        .unwrap();
    assert_eq!(read_reply(&mut stream).await, "250 Ok\r\n");

    stream.write_all(b"STARTTLS\r\n").await.unwrap();
    assert_eq!(read_reply(&mut stream).await, "220 Ready to start TLS\r\n");

    let tls = client_connector()
        .connect(
            rustls::ServerName::try_from("localhost").unwrap(),
            stream.into_inner(),
        )
        .await
        .unwrap();
    let mut stream = BufReader::new(tls);

    // RFC 3207: the client must identify itself again before anything else
    stream.write_all(b"EHLO after.example\r\n").await.unwrap();
    let capabilities = read_reply(&mut stream).await;
    assert!(!capabilities.contains("STARTTLS"));

    stream
        .write_all(b"MAIL FROM:<new@after.example>\r\n")
        .await
        .unwrap();
    assert_eq!(read_reply(&mut stream).await, "250 Ok\r\n");
    stream.write_all(b"RCPT TO:<c@d.example>\r\n").await.unwrap();
    assert_eq!(read_reply(&mut stream).await, "250 Ok\r\n");
    stream.write_all(b"DATA\r\n").await.unwrap();
    assert!(read_reply(&mut stream).await.starts_with("354 "));
    stream
        .write_all(b"Subject: upgraded\r\n\r\nover tls now\r\n.\r\n")
        .await
        .unwrap();
    assert!(read_reply(&mut stream).await.contains("queued as +"));
    stream.write_all(b"QUIT\r\n").await.unwrap();
    assert_eq!(read_reply(&mut stream).await, "221 Bye\r\n");

    shutdown.cancel();

    let messages = captured.lock().unwrap();
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    // nothing from before the upgrade survived
    assert_eq!(message.helo_domain, "after.example");
    assert_eq!(message.from.as_ref().unwrap().address, "new@after.example");
    assert_eq!(message.to.len(), 1);
}

