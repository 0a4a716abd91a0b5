use pipekit::{AsyncPipe, INVALID_HANDLE, IoContext, Pipe, PipeError, StreamBuf};
use pipekit_test_utils::init_tracing;
use similar_asserts::assert_eq;
use std::{
    cell::RefCell,
    io::{Read, Write},
    rc::Rc,
    thread,
};

type Slot = Rc<RefCell<Option<Result<usize, PipeError>>>>;

fn record(slot: &Slot) -> impl FnOnce(Result<usize, PipeError>) + 'static {
    let slot = Rc::clone(slot);
    move |res| {
        assert!(slot.borrow().is_none(), "completion ran twice");
        *slot.borrow_mut() = Some(res);
    }
}

fn line(buf: &StreamBuf) -> String {
    String::from_utf8(buf.to_vec()).unwrap()
}

#[test]
fn plain_async() {
    init_tracing();
    let ctx = IoContext::new().unwrap();
    let pipe = AsyncPipe::new(&ctx).unwrap();
    assert!(pipe.is_open());
    assert!(pipe.name().is_none());

    let written = Slot::default();
    let read = Slot::default();
    let buf = StreamBuf::new();
    pipe.async_write("test-string\n", record(&written));
    pipe.async_read_until(&buf, b'\n', record(&read));
    assert_eq!(ctx.pending(), 2);

    assert_eq!(ctx.run(), 2);
    assert_eq!(written.take().unwrap().unwrap(), 12);
    assert_eq!(read.take().unwrap().unwrap(), 12);
    assert_eq!(line(&buf), "test-string\n");
    assert_eq!(buf.read_line().as_deref(), Some("test-string"));
}

#[test]
fn reads_successive_lines() {
    let ctx = IoContext::new().unwrap();
    let pipe = Rc::new(AsyncPipe::new(&ctx).unwrap());
    let buf = StreamBuf::new();
    let lines = Rc::new(RefCell::new(Vec::new()));

    let (reader, out, data) = (Rc::clone(&pipe), Rc::clone(&lines), buf.clone());
    ctx.spawn(async move {
        for _ in 0..3 {
            reader.read_until(&data, b'\n').await.unwrap();
            out.borrow_mut().push(data.read_line().unwrap());
        }
    });
    pipe.async_write("one\ntwo\nthree\n", |res| assert_eq!(res.unwrap(), 14));

    assert_eq!(ctx.run(), 2);
    assert_eq!(*lines.borrow(), ["one", "two", "three"]);
    assert!(buf.is_empty());
}

#[test]
fn writes_larger_than_the_pipe_buffer() {
    let ctx = IoContext::new().unwrap();
    let pipe = AsyncPipe::new(&ctx).unwrap();
    let mut payload = vec![b'x'; 1 << 20];
    payload.push(b'\n');

    let written = Slot::default();
    let read = Slot::default();
    let buf = StreamBuf::new();
    pipe.async_write(payload.clone(), record(&written));
    pipe.async_read_until(&buf, b'\n', record(&read));
    ctx.run();

    assert_eq!(written.take().unwrap().unwrap(), payload.len());
    assert_eq!(read.take().unwrap().unwrap(), payload.len());
    assert_eq!(buf.len(), payload.len());
}

#[test]
fn closed_transform() {
    let ctx = IoContext::new().unwrap();
    let mut pipe = AsyncPipe::new(&ctx).unwrap();

    let mut downgraded = Pipe::try_from(&pipe).unwrap();
    assert!(downgraded.is_open());
    pipe.close();
    assert!(!pipe.is_open());
    assert!(downgraded.is_open());

    downgraded.write_all(b"still here\n").unwrap();
    let mut out = [0u8; 11];
    downgraded.read_exact(&mut out).unwrap();
    assert_eq!(&out, b"still here\n");

    let closed = pipe.to_pipe().unwrap();
    assert!(!closed.is_open());
    assert_eq!(closed.native_source(), INVALID_HANDLE);
}

#[test]
fn upgrade_plain_pipe() {
    let ctx = IoContext::new().unwrap();
    let mut plain = Pipe::new().unwrap();
    plain.write_all(b"queued\n").unwrap();

    let pipe = AsyncPipe::from_pipe(&ctx, plain).unwrap();
    let buf = StreamBuf::new();
    pipe.async_read_until(&buf, b'\n', |res| assert_eq!(res.unwrap(), 7));
    ctx.run();
    assert_eq!(line(&buf), "queued\n");

    assert!(!AsyncPipe::from_pipe(&ctx, Pipe::default()).unwrap().is_open());
}

#[test]
fn move_pipe() {
    let ctx = IoContext::new().unwrap();
    let mut source = AsyncPipe::new(&ctx).unwrap();
    let (read_end, write_end) = (source.native_source(), source.native_sink());

    let moved = source.take();
    assert!(!source.is_open());
    assert_eq!(source.native_source(), INVALID_HANDLE);
    assert_eq!(source.native_sink(), INVALID_HANDLE);
    assert!(moved.is_open());
    assert_eq!(moved.native_source(), read_end);
    assert_eq!(moved.native_sink(), write_end);
    assert!(moved.context().ptr_eq(&ctx));

    let again = source.take();
    assert!(!again.is_open());
}

#[test]
fn copy_pipe() {
    let ctx = IoContext::new().unwrap();
    let mut closed = AsyncPipe::new(&ctx).unwrap();
    closed.close();
    let copy = closed.try_clone().unwrap();
    assert!(!copy.is_open());

    let mut original = AsyncPipe::new(&ctx).unwrap();
    let copy = original.try_clone().unwrap();
    assert!(copy.is_open());
    assert_ne!(copy.native_source(), original.native_source());
    assert_ne!(copy.native_sink(), original.native_sink());

    original.close();
    assert!(copy.is_open());
    let buf = StreamBuf::new();
    copy.async_write("copied\n", |res| assert_eq!(res.unwrap(), 7));
    copy.async_read_until(&buf, b'\n', |res| assert_eq!(res.unwrap(), 7));
    assert_eq!(ctx.run(), 2);
    assert_eq!(line(&buf), "copied\n");
}

#[test]
fn close_aborts_pending_reads() {
    let ctx = IoContext::new().unwrap();
    let mut pipe = AsyncPipe::new(&ctx).unwrap();
    let read = Slot::default();
    pipe.async_read_until(&StreamBuf::new(), b'\n', record(&read));

    pipe.close();
    pipe.close();
    assert_eq!(ctx.run(), 1);
    assert!(read.take().unwrap().unwrap_err().is_aborted());
}

#[test]
fn drop_aborts_pending_reads() {
    let ctx = IoContext::new().unwrap();
    let read = Slot::default();
    {
        let pipe = AsyncPipe::new(&ctx).unwrap();
        pipe.async_read_until(&StreamBuf::new(), b'\n', record(&read));
    }
    assert_eq!(ctx.run(), 1);
    assert!(read.take().unwrap().unwrap_err().is_aborted());
}

#[test]
fn close_aborts_blocked_write() {
    let ctx = IoContext::new().unwrap();
    let pipe = Rc::new(RefCell::new(AsyncPipe::new(&ctx).unwrap()));
    let written = Slot::default();
    // Nobody reads, so the write stalls once the pipe buffer is full.
    pipe.borrow().async_write(vec![b'x'; 1 << 20], record(&written));

    let closer = Rc::clone(&pipe);
    ctx.spawn(async move {
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        closer.borrow_mut().close();
    });

    assert_eq!(ctx.run(), 2);
    assert!(written.take().unwrap().unwrap_err().is_aborted());
    assert!(!pipe.borrow().is_open());
    assert_eq!(ctx.pending(), 0);
}

#[test]
fn operations_on_closed_pipe_fail() {
    let ctx = IoContext::new().unwrap();
    let mut pipe = AsyncPipe::new(&ctx).unwrap();
    pipe.close();

    let written = Slot::default();
    let read = Slot::default();
    pipe.async_write("lost\n", record(&written));
    pipe.async_read_until(&StreamBuf::new(), b'\n', record(&read));
    assert_eq!(ctx.run(), 2);
    assert!(matches!(written.take().unwrap(), Err(PipeError::Closed)));
    assert!(matches!(read.take().unwrap(), Err(PipeError::Closed)));
}

#[test]
fn stopped_context_keeps_operations_pending() {
    let ctx = IoContext::new().unwrap();
    let pipe = AsyncPipe::new(&ctx).unwrap();
    let read = Slot::default();
    let buf = StreamBuf::new();
    pipe.async_read_until(&buf, b'\n', record(&read));

    ctx.stop();
    assert_eq!(ctx.run(), 0);
    assert_eq!(ctx.pending(), 1);

    ctx.restart();
    pipe.async_write("late\n", |_| {});
    assert_eq!(ctx.run(), 2);
    assert_eq!(read.take().unwrap().unwrap(), 5);
}

#[test]
fn multithreaded_async_pipe() {
    init_tracing();
    let threads = thread::available_parallelism().map_or(1, |n| n.get());
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            thread::spawn(|| {
                let ctx = IoContext::new().unwrap();
                let pipes: Vec<_> = (0..100).map(|_| AsyncPipe::new(&ctx).unwrap()).collect();
                assert!(pipes.iter().all(AsyncPipe::is_open));
                drop(pipes);
                assert_eq!(ctx.run(), 0);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}
