//! exec：镜像装载、参数栈和地址空间的整体替换。

mod common;

use common::{boot, run_root};
use kernel::{ImageBuilder, Program, RunOutcome};
use page_map::USERLO;
use rendezvous::SysApi;
use user_lib::exec::{exec, read_args};
use user_lib::file::write;
use user_lib::grant_rw;

fn hi_main(env: &mut dyn SysApi, esp: u32) -> i32 {
    // 参数栈搭对了吗
    let args = read_args(env, esp).unwrap();
    assert_eq!(args, ["hi", "world"]);
    // 正文段真的换上了，旧租户的记号没了
    let mut head = [0u8; 4];
    env.mem_read(USERLO, &mut head).unwrap();
    assert_eq!(&head, b"SEG!");
    write(env, 1, b"hi").unwrap();
    0
}

#[test]
fn exec_replaces_the_caller() {
    // S5：exec 一个往控制台写 "hi" 的小程序
    let image = ImageBuilder::at_userlo()
        .segment(USERLO, b"SEG!", false)
        .build();
    let node = boot(vec![Program {
        name: "hi".into(),
        image,
        main: hi_main,
    }]);
    let (node, out) = run_root(node, |env| {
        // 先留个记号，变身之后它应该消失
        grant_rw(env, USERLO, page_map::PAGE_SIZE as u32).unwrap();
        env.mem_write(USERLO, &[0xAB; 4]).unwrap();
        match exec(env, "hi", &["hi", "world"]) {
            Ok(code) => code,
            Err(e) => {
                log::error!("exec failed: {e}");
                -1
            }
        }
    });
    assert_eq!(out, RunOutcome::Exited(0));
    let text = String::from_utf8_lossy(node.console_output()).into_owned();
    assert!(text.contains("hi"));
}

#[test]
fn exec_missing_image_fails_cleanly() {
    let (_, out) = run_root(boot(vec![]), |env| {
        match exec(env, "nothing-here", &[]) {
            Err(user_lib::UserError::NotFound) => 0,
            _ => 1,
        }
    });
    assert_eq!(out, RunOutcome::Exited(0));
}
