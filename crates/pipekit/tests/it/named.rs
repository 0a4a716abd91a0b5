use pipekit::{AsyncPipe, IoContext, PipeConfig, PipeError, StreamBuf};
use pipekit_test_utils::{pipetest, remove_pipe};
use similar_asserts::assert_eq;
use std::{
    cell::RefCell,
    os::unix::fs::{FileTypeExt, PermissionsExt},
    path::Path,
    rc::Rc,
};

/// A creator and an opener of the same named pipe.
struct NamedFixture {
    ctx: IoContext,
    created: AsyncPipe,
    opened: AsyncPipe,
}

impl NamedFixture {
    fn new(path: &Path) -> Self {
        let ctx = IoContext::new().unwrap();
        let created = AsyncPipe::named(&ctx, path).unwrap();
        let opened = AsyncPipe::open_existing(&ctx, path).unwrap();
        Self { ctx, created, opened }
    }

    fn exchange(&self, from: &AsyncPipe, to: &AsyncPipe, data: &'static str) -> String {
        let buf = StreamBuf::new();
        let received = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&received);
        from.async_write(data, |res| assert_eq!(res.unwrap(), data.len()));
        to.async_read_until(&buf, b'\n', move |res| *slot.borrow_mut() = Some(res.unwrap()));
        assert_eq!(self.ctx.run(), 2);
        assert_eq!(received.take(), Some(data.len()));
        String::from_utf8(buf.to_vec()).unwrap()
    }
}

pipetest!(creator_to_opener, |path| {
    let fixture = NamedFixture::new(path.path());
    assert_eq!(fixture.created.name(), Some(path.path()));
    assert_eq!(fixture.opened.name(), Some(path.path()));

    let got = fixture.exchange(&fixture.created, &fixture.opened, "test-string\n");
    assert_eq!(got, "test-string\n");
});

pipetest!(opener_to_creator, |path| {
    let fixture = NamedFixture::new(path.path());
    let got = fixture.exchange(&fixture.opened, &fixture.created, "test-string\n");
    assert_eq!(got, "test-string\n");
});

pipetest!(hello_scenario, |path| {
    let ctx = IoContext::new().unwrap();
    let writer = AsyncPipe::named(&ctx, path.path()).unwrap();
    let reader = AsyncPipe::open_existing(&ctx, path.path()).unwrap();

    let buf = StreamBuf::new();
    writer.async_write("hello\n", |res| assert_eq!(res.unwrap(), 6));
    reader.async_read_until(&buf, b'\n', |res| assert_eq!(res.unwrap(), 6));
    ctx.run();

    assert_eq!(buf.read_line().as_deref(), Some("hello"));
});

pipetest!(entry_outlives_pipes_until_removed, |path| {
    {
        let fixture = NamedFixture::new(path.path());
        assert!(fixture.created.is_open() && fixture.opened.is_open());
    }
    let file_type = std::fs::metadata(path.path()).unwrap().file_type();
    assert!(file_type.is_fifo());

    remove_pipe(path.path()).unwrap();
    assert!(!path.path().exists());
});

pipetest!(creating_twice_fails, |path| {
    let ctx = IoContext::new().unwrap();
    let _first = AsyncPipe::named(&ctx, path.path()).unwrap();
    let err = AsyncPipe::named(&ctx, path.path()).unwrap_err();
    assert!(matches!(&err, PipeError::Creation { name: Some(name), .. } if name == path.path()));
    assert_eq!(err.raw_os_error(), Some(nix::libc::EEXIST));
});

pipetest!(opening_missing_pipe_fails, |path| {
    let ctx = IoContext::new().unwrap();
    let err = AsyncPipe::open_existing(&ctx, path.path()).unwrap_err();
    assert!(matches!(err, PipeError::Open { .. }));
    assert!(!path.path().exists());
});

pipetest!(opening_regular_file_fails, |path| {
    std::fs::write(path.path(), b"not a pipe").unwrap();
    let ctx = IoContext::new().unwrap();
    let err = AsyncPipe::open_existing(&ctx, path.path()).unwrap_err();
    assert!(matches!(err, PipeError::Open { .. }), "{err:?}");
});

pipetest!(fifo_mode_comes_from_config, |path| {
    let config = PipeConfig { fifo_mode: 0o400, ..Default::default() };
    let ctx = IoContext::with_config(config).unwrap();
    match AsyncPipe::named(&ctx, path.path()) {
        // Root is not subject to the permission check when opening read-write.
        Ok(_) => {
            let mode = std::fs::metadata(path.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o400);
        }
        Err(err) => {
            assert!(matches!(err, PipeError::Creation { .. }), "{err:?}");
            assert!(!path.path().exists());
        }
    }
});
