#![cfg_attr(target_arch = "riscv32", no_std)]
#![cfg_attr(target_arch = "riscv32", no_main)]

#[cfg(not(target_arch = "riscv32"))]
fn main() {
    eprintln!(
        "soil-node {} is ESP32-C3 firmware; build it with `cargo firmware`",
        soil_node::VERSION
    );
}

// Add app descriptor for espflash compatibility
#[cfg(target_arch = "riscv32")]
esp_bootloader_esp_idf::esp_app_desc!();

#[cfg(target_arch = "riscv32")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    esp_println::println!("[PANIC] {}", info);
    loop {}
}

#[cfg(target_arch = "riscv32")]
#[esp_hal::main]
fn main() -> ! {
    firmware::start()
}

#[cfg(target_arch = "riscv32")]
mod firmware {
    use core::net::Ipv4Addr;
    use embassy_net::udp::PacketMetadata;
    use embassy_net::{Config, Ipv4Cidr, Runner, Stack, StackResources, StaticConfigV4};
    use embassy_time::{Duration, Timer};
    use esp_hal::clock::CpuClock;
    use esp_hal::rmt::{Rmt, TxChannelConfig, TxChannelCreator};
    use esp_hal::rng::Rng;
    use esp_hal::time::Rate;
    use esp_hal::timer::timg::TimerGroup;
    use esp_hal_embassy::Executor;
    use esp_storage::FlashStorage;
    use esp_wifi::wifi::{self, WifiDevice};
    use log::{error, info, warn};
    use static_cell::StaticCell;

    use soil_node::config::{self, SyncConfig};
    use soil_node::dns_server::DnsResponder;
    use soil_node::flash_store::FlashRecordStorage;
    use soil_node::http_server::{HttpListener, PortalSockets};
    use soil_node::mqtt::{MqttBuffers, MqttConnector};
    use soil_node::portal::DNS_BUFFER_SIZE;
    use soil_node::status_led::StatusIndicator;
    use soil_node::status_led::LedStatus;
    use soil_node::status_led::driver::PixelIndicator;
    use soil_node::store::RecordStore;
    use soil_node::sync::{SyncDeps, SyncOrchestrator, SyncOutcome};
    use soil_node::wifi::WiFiManager;

    type LedChannel = esp_hal::rmt::Channel<esp_hal::Blocking, 0>;
    type Deps = SyncDeps<
        FlashRecordStorage,
        WiFiManager<'static>,
        PortalSockets<'static>,
        MqttConnector<'static>,
        Rng,
        PixelIndicator<LedChannel>,
    >;

    // Static cells for embassy components
    static WIFI_INIT_CELL: StaticCell<esp_wifi::EspWifiController<'static>> = StaticCell::new();
    static AP_RESOURCES: StaticCell<StackResources<4>> = StaticCell::new();
    static STA_RESOURCES: StaticCell<StackResources<4>> = StaticCell::new();
    static EXECUTOR: StaticCell<Executor> = StaticCell::new();

    static DNS_RX_META: StaticCell<[PacketMetadata; 4]> = StaticCell::new();
    static DNS_TX_META: StaticCell<[PacketMetadata; 4]> = StaticCell::new();
    static DNS_RX: StaticCell<[u8; DNS_BUFFER_SIZE]> = StaticCell::new();
    static DNS_TX: StaticCell<[u8; DNS_BUFFER_SIZE]> = StaticCell::new();
    static HTTP_RX: StaticCell<[u8; 2048]> = StaticCell::new();
    static HTTP_TX: StaticCell<[u8; 4096]> = StaticCell::new();
    static MQTT_SOCKET_RX: StaticCell<[u8; 2048]> = StaticCell::new();
    static MQTT_SOCKET_TX: StaticCell<[u8; 2048]> = StaticCell::new();
    static MQTT_WRITE: StaticCell<[u8; 1024]> = StaticCell::new();
    static MQTT_RECV: StaticCell<[u8; 1024]> = StaticCell::new();

    #[embassy_executor::task(pool_size = 2)]
    async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) -> ! {
        runner.run().await
    }

    /// DHCP server handing out leases on the portal network
    #[embassy_executor::task]
    async fn dhcp_task(stack: Stack<'static>, gateway: Ipv4Addr) {
        use core::net::{SocketAddr, SocketAddrV4};
        use edge_dhcp::io::{self, DEFAULT_SERVER_PORT};
        use edge_dhcp::server::{Server, ServerOptions};
        use edge_nal::UdpBind;
        use edge_nal_embassy::{Udp, UdpBuffers};

        let mut buf = [0u8; 1500];
        let mut gateway_buf = [Ipv4Addr::UNSPECIFIED];

        let buffers = UdpBuffers::<2, 1024, 1024, 4>::new();
        let unbound = Udp::new(stack, &buffers);
        let mut socket = match unbound
            .bind(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                DEFAULT_SERVER_PORT,
            )))
            .await
        {
            Ok(socket) => socket,
            Err(e) => {
                error!("[DHCP] Failed to bind server: {:?}", e);
                return;
            }
        };
        info!("[DHCP] Server up on {}", gateway);

        loop {
            if let Err(e) = io::server::run(
                &mut Server::<_, 16>::new_with_et(gateway),
                &ServerOptions::new(gateway, Some(&mut gateway_buf)),
                &mut socket,
                &mut buf,
            )
            .await
            {
                warn!("[DHCP] Server error: {:?}", e);
            }
            Timer::after(Duration::from_millis(500)).await;
        }
    }

    /// Runs provisioning once, then resets or idles
    #[embassy_executor::task]
    async fn sync_task(deps: Deps) -> ! {
        let mut orchestrator = SyncOrchestrator::new(deps, SyncConfig::default());

        let outcome = orchestrator.run().await;
        match outcome {
            Ok(SyncOutcome::Synced(node)) => {
                info!(
                    "[MAIN] Node ready on \"{}\" for serial {}",
                    node.wifi.ssid, node.entry.serial_code
                );
                if let Some(binding) = &node.binding {
                    info!("[MAIN] Bound by request {}", binding);
                }
                for sensor in node.credentials.iter() {
                    info!("[MAIN] Sensor {} bound to {}", sensor.kind, sensor.id);
                }
                loop {
                    Timer::after(Duration::from_secs(60)).await;
                }
            }
            Ok(SyncOutcome::Restart(reason)) => {
                info!("[MAIN] Restarting: {:?}", reason);
                // Let the last HTTP response and log lines drain
                Timer::after(Duration::from_millis(500)).await;
            }
            Err(e) => {
                error!(
                    "[MAIN] Provisioning failed: {}, resetting in {}s",
                    e,
                    config::FAILURE_RESET_DELAY_MS / 1000
                );
                Timer::after(Duration::from_millis(config::FAILURE_RESET_DELAY_MS)).await;
            }
        }
        esp_hal::system::software_reset()
    }

    pub fn start() -> ! {
        esp_println::logger::init_logger_from_env();
        info!("[MAIN] soil-node {}", soil_node::VERSION);

        let hal_config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
        let peripherals = esp_hal::init(hal_config);

        // Initialize heap allocator for WiFi (72KB)
        esp_alloc::heap_allocator!(size: 72 * 1024);

        let timer_group0 = TimerGroup::new(peripherals.TIMG0);
        esp_hal_embassy::init(timer_group0.timer0);

        // Status pixel first so the boot stage is visible
        let rmt = Rmt::new(peripherals.RMT, Rate::from_mhz(10)).expect("RMT initialization failed");
        let tx_config = TxChannelConfig::default()
            .with_clk_divider(1)
            .with_idle_output_level(esp_hal::gpio::Level::Low)
            .with_idle_output(false)
            .with_carrier_modulation(false);
        let led_channel = rmt
            .channel0
            .configure(peripherals.GPIO8, tx_config)
            .expect("RMT channel configuration failed");
        let mut indicator = PixelIndicator::new(led_channel);
        indicator.set_status(LedStatus::Starting);
        info!("[LED] Status pixel on GPIO{}", config::LED_DATA_PIN);

        // Initialize WiFi driver
        let timer_group1 = TimerGroup::new(peripherals.TIMG1);
        let rng = Rng::new(peripherals.RNG);
        let wifi_init = esp_wifi::init(timer_group1.timer0, rng, peripherals.RADIO_CLK)
            .expect("WiFi driver initialization failed");
        let wifi_init = WIFI_INIT_CELL.init(wifi_init);
        let (controller, interfaces) =
            wifi::new(wifi_init, peripherals.WIFI).expect("WiFi controller creation failed");
        let mac = esp_hal::efuse::Efuse::mac_address();

        let seed = {
            let mut rng = rng;
            (rng.random() as u64) << 32 | rng.random() as u64
        };

        let [a, b, c, d] = config::PORTAL_IP;
        let gateway = Ipv4Addr::new(a, b, c, d);
        let ap_config = Config::ipv4_static(StaticConfigV4 {
            address: Ipv4Cidr::new(gateway, config::PORTAL_PREFIX_LEN),
            gateway: Some(gateway),
            dns_servers: Default::default(),
        });
        let (ap_stack, ap_runner) = embassy_net::new(
            interfaces.ap,
            ap_config,
            AP_RESOURCES.init(StackResources::new()),
            seed,
        );
        let (sta_stack, sta_runner) = embassy_net::new(
            interfaces.sta,
            Config::dhcpv4(Default::default()),
            STA_RESOURCES.init(StackResources::new()),
            seed,
        );
        info!("[WIFI] Access point and station stacks created");

        let dns = DnsResponder::new(
            ap_stack,
            DNS_RX_META.init([PacketMetadata::EMPTY; 4]),
            DNS_RX.init([0; DNS_BUFFER_SIZE]),
            DNS_TX_META.init([PacketMetadata::EMPTY; 4]),
            DNS_TX.init([0; DNS_BUFFER_SIZE]),
        )
        .expect("DNS socket bind failed");
        let http = HttpListener::new(ap_stack, HTTP_RX.init([0; 2048]), HTTP_TX.init([0; 4096]));

        let connector = MqttConnector::new(
            sta_stack,
            mac,
            MqttBuffers {
                socket_rx: MQTT_SOCKET_RX.init([0; 2048]),
                socket_tx: MQTT_SOCKET_TX.init([0; 2048]),
                client_write: MQTT_WRITE.init([0; 1024]),
                client_recv: MQTT_RECV.init([0; 1024]),
            },
        );

        let store = RecordStore::new(FlashRecordStorage::new(
            FlashStorage::new(),
            config::FLASH_RECORD_BASE,
        ));

        let deps = SyncDeps {
            store,
            link: WiFiManager::new(controller, sta_stack),
            portal_io: PortalSockets::new(dns, http),
            connector,
            entropy: rng,
            indicator,
        };

        let executor = EXECUTOR.init(Executor::new());
        executor.run(|spawner| {
            info!("[MAIN] Spawning network tasks...");
            spawner.spawn(net_task(ap_runner)).ok();
            spawner.spawn(net_task(sta_runner)).ok();
            spawner.spawn(dhcp_task(ap_stack, gateway)).ok();

            info!("[MAIN] Spawning sync task...");
            match spawner.spawn(sync_task(deps)) {
                Ok(_) => info!("[MAIN] Sync task spawned"),
                Err(e) => error!("[MAIN] Failed to spawn sync task: {:?}", e),
            }
        })
    }
}
