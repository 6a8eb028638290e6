//! Helper utilities for using x11rb as an event source in calloop.

use std::{
    io::{self, Result as IOResult},
    sync::Arc,
    thread::{spawn, JoinHandle},
};

use x11rb::{
    connection::Connection as _,
    protocol::{
        xproto::{Atom, ClientMessageEvent, ConnectionExt as _, EventMask, Window, CLIENT_MESSAGE_EVENT},
        Event,
    },
    rust_connection::RustConnection,
};

use calloop::{
    channel::{sync_channel, Channel, Event as ChannelEvent, SyncSender},
    EventSource, Poll, PostAction, Readiness, Token, TokenFactory,
};
use tracing::{error, warn};

/// Something read from the X11 connection
#[derive(Debug)]
pub enum X11SourceEvent {
    /// An event was received from the server
    Event(Event),
    /// The connection was lost and no further events will arrive
    Closed,
}

/// Integration of an x11rb X11 connection with calloop.
///
/// This is a thin wrapper around `Channel`. It works by spawning an extra thread reads events from
/// the X11 connection and then sends them across the channel.
///
/// See [1] for why this extra thread is necessary. The single-thread solution proposed on that
/// page does not work with calloop, since it requires checking something on every main loop
/// iteration. Calloop only allows "when an FD becomes readable".
///
/// [1]: https://docs.rs/x11rb/0.13.0/x11rb/event_loop_integration/index.html#threads-and-races
#[derive(Debug)]
pub struct X11Source {
    connection: Arc<RustConnection>,
    channel: Option<Channel<Event>>,
    event_thread: Option<JoinHandle<()>>,
    close_window: Window,
    close_type: Atom,
}

impl X11Source {
    /// Create a new X11 source.
    ///
    /// The returned instance will use `SendRequest` to cause a `ClientMessageEvent` to be sent to
    /// the given window with the given type. The expectation is that this is a window that was
    /// created by us. Thus, the event reading thread will wake up and check an internal exit flag,
    /// then exit.
    pub fn new(connection: Arc<RustConnection>, close_window: Window, close_type: Atom) -> Self {
        let (sender, channel) = sync_channel(5);
        let conn = Arc::clone(&connection);
        let event_thread = Some(spawn(move || {
            run_event_thread(conn, sender);
        }));

        Self {
            connection,
            channel: Some(channel),
            event_thread,
            close_window,
            close_type,
        }
    }
}

impl Drop for X11Source {
    fn drop(&mut self) {
        // Signal the worker thread to exit by dropping the read end of the channel.
        self.channel.take();

        // Send an event to wake up the worker so that it actually exits
        let event = ClientMessageEvent {
            response_type: CLIENT_MESSAGE_EVENT,
            format: 8,
            sequence: 0,
            window: self.close_window,
            type_: self.close_type,
            data: [0; 20].into(),
        };

        let _ = self
            .connection
            .send_event(false, self.close_window, EventMask::NO_EVENT, event);
        let _ = self.connection.flush();

        self.event_thread.take().map(|handle| handle.join());
    }
}

impl EventSource for X11Source {
    type Event = X11SourceEvent;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<C>(
        &mut self,
        readiness: Readiness,
        token: Token,
        mut callback: C,
    ) -> IOResult<PostAction>
    where
        C: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        let Some(channel) = &mut self.channel else {
            return Ok(PostAction::Remove);
        };

        forward_events(channel, readiness, token, |event| match event {
            Some(event) => callback(X11SourceEvent::Event(event), &mut ()),
            None => callback(X11SourceEvent::Closed, &mut ()),
        })
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        if let Some(channel) = &mut self.channel {
            channel.register(poll, factory)?;
        }

        Ok(())
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        if let Some(channel) = &mut self.channel {
            channel.reregister(poll, factory)?;
        }

        Ok(())
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        if let Some(channel) = &mut self.channel {
            channel.unregister(poll)?;
        }

        Ok(())
    }
}

/// Pass queued messages on, then `None` once if the sending side is gone
///
/// Dropping the last sender may only surface as removal of the channel's wakeup source,
/// without a `Closed` event.
fn forward_events<T, C>(
    channel: &mut Channel<T>,
    readiness: Readiness,
    token: Token,
    mut callback: C,
) -> IOResult<PostAction>
where
    C: FnMut(Option<T>),
{
    let mut closed = false;
    let action = channel
        .process_events(readiness, token, |event, _| match event {
            ChannelEvent::Msg(event) => callback(Some(event)),
            ChannelEvent::Closed => closed = true,
        })
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    if closed || matches!(action, PostAction::Remove) {
        warn!("X11 event thread exited");
        callback(None);
        return Ok(PostAction::Remove);
    }
    Ok(action)
}

/// This thread reads X11 events from the connection and sends them on the channel.
///
/// Sending a request or waiting for a reply can read events from the socket into the
/// RustConnection's internal queue, so readability of the socket alone does not guarantee we
/// never miss a wakeup. Blocking in wait_for_event() here sidesteps that.
fn run_event_thread(connection: Arc<RustConnection>, sender: SyncSender<Event>) {
    loop {
        let event = match connection.wait_for_event() {
            Ok(event) => event,
            Err(err) => {
                // Connection errors are permanent. Dropping the sender closes the channel.
                error!("X11 event thread exiting due to connection error: {}", err);
                break;
            }
        };
        if sender.send(event).is_err() {
            // X11Source was dropped.
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use calloop::EventLoop;

    use super::*;

    #[derive(Debug)]
    struct Forwarder(Channel<u32>);

    impl EventSource for Forwarder {
        type Event = Option<u32>;
        type Metadata = ();
        type Ret = ();
        type Error = io::Error;

        fn process_events<C>(&mut self, readiness: Readiness, token: Token, mut callback: C) -> IOResult<PostAction>
        where
            C: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
        {
            forward_events(&mut self.0, readiness, token, |event| callback(event, &mut ()))
        }

        fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
            self.0.register(poll, factory)
        }

        fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
            self.0.reregister(poll, factory)
        }

        fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
            self.0.unregister(poll)
        }
    }

    fn dispatch_once(feed: impl FnOnce(SyncSender<u32>)) -> Vec<Option<u32>> {
        let mut event_loop = EventLoop::<Vec<Option<u32>>>::try_new().unwrap();
        let (sender, channel) = sync_channel(5);
        event_loop
            .handle()
            .insert_source(Forwarder(channel), |event, _, seen| seen.push(event))
            .map_err(|err| err.error)
            .unwrap();

        feed(sender);

        let mut seen = Vec::new();
        event_loop.dispatch(Duration::ZERO, &mut seen).unwrap();
        seen
    }

    #[test]
    fn queued_events_arrive_before_closure() {
        let seen = dispatch_once(|sender| {
            sender.send(1).unwrap();
            sender.send(2).unwrap();
        });
        assert_eq!(seen, vec![Some(1), Some(2), None]);
    }

    #[test]
    fn closure_without_queued_events_is_reported() {
        let seen = dispatch_once(drop);
        assert_eq!(seen, vec![None]);
    }
}
