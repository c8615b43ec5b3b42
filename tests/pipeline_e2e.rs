
use std::time::{Duration, Instant};

use meeseeks_box::config::Config;
use meeseeks_box::formatter::{default_messages, ReplyStyle, HANDSHAKE};
use meeseeks_box::jobs::{JobFilter, JobStatus};

use harness::TestBot;

const CONFIG: &str = r#"
commands:
  echo:
    command: echo
    arguments: ["hi"]
    auth_strategy: any
  echo-2:
    command: echo
    auth_strategy: any
  sleepy:
    command: sleep
    arguments: ["10"]
    timeout: 1
    auth_strategy: any
  danger:
    command: rm
    auth_strategy: group
    allowed_groups: [admin]
groups:
  admin: [pablo]
"#;

#[tokio::test]
async fn echo_success_handshake_then_output() {
    let bot = TestBot::start(CONFIG).await;
    bot.say_im("pablo", "echo world").await;

    let handshake = bot.next_reply().await;
    assert!(
        default_messages()[HANDSHAKE].contains(&handshake.text),
        "unexpected handshake: {}",
        handshake.text
    );

    let success = bot.next_reply().await;
    assert!(
        success.text.contains("```\nhi world\n```"),
        "unexpected success reply: {}",
        success.text
    );
    bot.expect_silence().await;

    let jobs = bot.app.jobs.filter(JobFilter::default()).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Successful);
    assert_eq!(jobs[0].request.command, "echo");

    let log = bot.app.jobs.get_log(jobs[0].id).await.unwrap();
    assert_eq!(log.lines, vec!["hi world"]);
    bot.shutdown().await;
}

#[tokio::test]
async fn timeout_kills_the_job_within_the_deadline() {
    let bot = TestBot::start(CONFIG).await;
    let started = Instant::now();
    bot.say_im("pablo", "sleepy").await;

    let _handshake = bot.next_reply().await;
    let failure = bot.next_reply().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(
        failure.text.contains("command timed out"),
        "unexpected failure reply: {}",
        failure.text
    );

    let jobs = bot.app.jobs.filter(JobFilter::default()).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Killed);
    let end = jobs[0].end_time.expect("killed jobs have an end time");
    assert!((end - jobs[0].start_time).num_seconds() <= 2);
    bot.shutdown().await;
}

#[tokio::test]
async fn unauthorized_command_replies_once_and_never_runs() {
    let bot = TestBot::start(CONFIG).await;
    bot.say_im("nobody", "danger").await;

    let reply = bot.next_reply().await;
    assert!(
        reply.text.contains("danger"),
        "unexpected unauthorized reply: {}",
        reply.text
    );
    bot.expect_silence().await;

    // no job row was created, so the executor never ran
    let jobs = bot.app.jobs.filter(JobFilter::default()).await.unwrap();
    assert!(jobs.is_empty());
    bot.shutdown().await;
}

#[tokio::test]
async fn unknown_command_replies_once_without_a_job() {
    let bot = TestBot::start(CONFIG).await;
    bot.say_im("pablo", "sdfgsdfg").await;

    let reply = bot.next_reply().await;
    assert!(
        reply.text.contains("sdfgsdfg"),
        "unexpected unknown command reply: {}",
        reply.text
    );
    bot.expect_silence().await;

    let jobs = bot.app.jobs.filter(JobFilter::default()).await.unwrap();
    assert!(jobs.is_empty());
    bot.shutdown().await;
}

#[tokio::test]
async fn empty_messages_are_ignored() {
    let bot = TestBot::start(CONFIG).await;
    bot.say_im("pablo", "   ").await;
    bot.expect_silence().await;
    bot.shutdown().await;
}

#[tokio::test]
async fn channel_policy_blocks_outside_the_allow_list() {
    let bot = TestBot::start(
        r#"
commands:
  deploy:
    command: echo
    auth_strategy: any
    channel_strategy: allowed
    allowed_channels: [deploys]
"#,
    )
    .await;

    bot.say("pablo", "C-general", "deploy app").await;
    let denied = bot.next_reply().await;
    assert!(denied.text.contains("deploy"));
    assert!(
        bot.app
            .jobs
            .filter(JobFilter::default())
            .await
            .unwrap()
            .is_empty()
    );

    // IM bypasses the channel allow list
    bot.say_im("pablo", "deploy app").await;
    let _handshake = bot.next_reply().await;
    let success = bot.next_reply().await;
    assert!(success.text.contains("app"));
    bot.shutdown().await;
}

#[tokio::test]
async fn hot_reload_swaps_catalog_and_groups_but_keeps_jobs() {
    let bot = TestBot::start(CONFIG).await;

    bot.say_im("pablo", "echo one").await;
    let _handshake = bot.next_reply().await;
    let _success = bot.next_reply().await;
    let job1 = bot.app.jobs.filter(JobFilter::default()).await.unwrap()[0].clone();

    let config_b = Config::parse(
        r#"
commands:
  echo:
    command: echo
    timeout: 30
    auth_strategy: any
groups:
  admin: [daniele, pablo]
"#,
    )
    .unwrap();
    bot.app.reload(&config_b);

    // echo-2 is gone, echo carries the new timeout
    bot.say_im("pablo", "echo-2 x").await;
    let unknown = bot.next_reply().await;
    assert!(unknown.text.contains("echo-2"));

    let resolved = bot
        .app
        .registry
        .find(&meeseeks_box::jobs::Request {
            command: "echo".to_string(),
            ..Default::default()
        })
        .await
        .expect("echo survives the reload");
    assert_eq!(resolved.command.opts().timeout, Duration::from_secs(30));

    let admins = bot.app.auth.list();
    assert_eq!(
        admins.get("admin").unwrap(),
        &vec!["daniele".to_string(), "pablo".to_string()]
    );

    // job1 is still there, untouched
    let kept = bot.app.jobs.get(job1.id).await.unwrap();
    assert_eq!(kept.request, job1.request);
    assert_eq!(kept.status, job1.status);
    bot.shutdown().await;
}

#[tokio::test]
async fn builtin_help_jobs_and_alias_work_end_to_end() {
    let bot = TestBot::start(CONFIG).await;

    bot.say_im("pablo", "help").await;
    let help = bot.next_reply().await;
    for name in ["help", "version", "jobs", "cancel", "echo", "danger"] {
        assert!(help.text.contains(name), "help misses {}: {}", name, help.text);
    }

    // run something so jobs has content, then list it
    bot.say_im("pablo", "echo there").await;
    let _handshake = bot.next_reply().await;
    let _success = bot.next_reply().await;

    bot.say_im("pablo", "jobs").await;
    let jobs_reply = bot.next_reply().await;
    assert!(jobs_reply.text.contains("*echo*"));
    assert!(jobs_reply.text.contains("*successful*"));

    // builtins do not create job rows
    let before = bot.app.jobs.filter(JobFilter::default()).await.unwrap().len();
    bot.say_im("pablo", "version").await;
    let _version = bot.next_reply().await;
    let after = bot.app.jobs.filter(JobFilter::default()).await.unwrap().len();
    assert_eq!(before, after);

    // alias a command and run it through the alias
    bot.say_im("pablo", "alias add shout echo loud").await;
    let _added = bot.next_reply().await;
    bot.say_im("pablo", "shout noise").await;
    let _handshake = bot.next_reply().await;
    let success = bot.next_reply().await;
    assert!(
        success.text.contains("hi loud noise"),
        "alias expansion failed: {}",
        success.text
    );
    bot.shutdown().await;
}

#[tokio::test]
async fn groups_builtin_is_admin_only() {
    let bot = TestBot::start(CONFIG).await;

    bot.say_im("nobody", "groups").await;
    let denied = bot.next_reply().await;
    assert!(denied.text.contains("groups"));

    bot.say_im("pablo", "groups").await;
    let listed = bot.next_reply().await;
    assert!(listed.text.contains("admin"));
    bot.shutdown().await;
}

#[tokio::test]
async fn cancel_builtin_kills_a_running_job() {
    let bot = TestBot::start(
        r#"
commands:
  sleepy:
    command: sleep
    arguments: ["30"]
    timeout: 60
    auth_strategy: any
"#,
    )
    .await;

    bot.say_im("pablo", "sleepy").await;
    let _handshake = bot.next_reply().await;

    // wait for the job row to exist, then cancel it
    let job = loop {
        let jobs = bot.app.jobs.filter(JobFilter::default()).await.unwrap();
        if let Some(job) = jobs.first() {
            break job.clone();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    bot.say_im("pablo", &format!("cancel {}", job.id)).await;

    // the cancel acknowledgement and the killed job's failure reply race
    let first = bot.next_reply().await;
    let second = bot.next_reply().await;
    let texts = format!("{}\n{}", first.text, second.text);
    assert!(texts.contains(&job.id.to_string()), "unexpected replies: {}", texts);
    assert!(texts.contains("command was killed"), "unexpected replies: {}", texts);
    assert_eq!(
        bot.app.jobs.get(job.id).await.unwrap().status,
        JobStatus::Killed
    );
    bot.shutdown().await;
}

#[tokio::test]
async fn reply_styles_follow_the_configuration() {
    let bot = TestBot::start(
        r#"
commands:
  echo:
    command: echo
    auth_strategy: any
format:
  reply_style:
    echo: text
"#,
    )
    .await;

    bot.say_im("pablo", "echo styled").await;
    let handshake = bot.next_reply().await;
    assert_eq!(handshake.style, ReplyStyle::Text);
    let success = bot.next_reply().await;
    assert_eq!(success.style, ReplyStyle::Text);
    bot.shutdown().await;
}
