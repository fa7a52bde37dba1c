//! bleadv firmware - nRF52832 + SoftDevice S132.
//!
//! Tasks:
//! - `softdevice_task`: SoftDevice event loop
//! - `advertiser_task`: fast/slow advertising windows, serves one peer at a time
//! - `worker_task`: worker engine tick (stall watchdog while connected)

#![no_std]
#![no_main]

mod softdevice;

use bleadv::ble::service::{Advertiser, REGISTRY};
use bleadv::ble::{AdvEvent, AdvMode, BleEvent, ConnHandle, PeerAddress};
use bleadv::config;
use defmt::{error, info, unwrap, warn};
use embassy_executor::Spawner;
use embassy_futures::select::{select, Either};
use embassy_nrf::interrupt::Priority;
use embassy_time::{Duration, Ticker, Timer};
use heapless::Vec;
use nrf_softdevice::ble::{gatt_server, peripheral, Connection};
use nrf_softdevice::{raw, Softdevice};
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

use crate::softdevice::{vendor_uuid_bytes, with_server, GattTable, SdLink, Server, ADV_REQUEST};

static GATT: StaticCell<GattTable> = StaticCell::new();

#[embassy_executor::task]
async fn softdevice_task(sd: &'static Softdevice) -> ! {
    sd.run().await
}

#[embassy_executor::task]
async fn worker_task() -> ! {
    let mut ticker = Ticker::every(Duration::from_secs(config::WORKER_PACE_SECS as u64));
    loop {
        ticker.next().await;
        with_server(|server| server.tick());
    }
}

#[embassy_executor::task]
async fn advertiser_task(sd: &'static Softdevice, gatt: &'static GattTable) -> ! {
    let adv_data = adv_data();
    let scan_data = scan_data();

    loop {
        let request = ADV_REQUEST.wait().await;
        let mut mode = request.mode;

        loop {
            let (interval, window, event) = match mode {
                AdvMode::Fast => (
                    request.config.fast_interval,
                    request.config.fast_timeout_secs,
                    AdvEvent::Fast,
                ),
                AdvMode::Slow => (
                    request.config.slow_interval,
                    request.config.slow_timeout_secs,
                    AdvEvent::Slow,
                ),
            };
            with_server(|server| server.handle_event(BleEvent::Advertising(event)));

            let adv = peripheral::ConnectableAdvertisement::ScannableUndirected {
                adv_data: &adv_data,
                scan_data: &scan_data,
            };
            let adv_config = peripheral::Config {
                interval,
                ..Default::default()
            };
            let advertise = peripheral::advertise_connectable(sd, adv, &adv_config);
            let window = Timer::after(Duration::from_secs(window as u64));

            match select(advertise, window).await {
                Either::First(Ok(conn)) => {
                    serve(gatt, conn).await;
                    // Advertising resumes on request, after disconnection.
                    break;
                }
                Either::First(Err(err)) => {
                    error!("Advertising failed: {:?}", err);
                    Timer::after(Duration::from_secs(1)).await;
                }
                Either::Second(()) => match mode {
                    AdvMode::Fast => mode = AdvMode::Slow,
                    AdvMode::Slow => {
                        with_server(|server| {
                            server.handle_event(BleEvent::Advertising(AdvEvent::Idle))
                        });
                        break;
                    }
                },
            }
        }
    }
}

/// Run the GATT server on `conn` until the peer leaves.
async fn serve(gatt: &'static GattTable, conn: Connection) {
    let Some(handle) = conn.handle() else {
        return;
    };
    let peer = PeerAddress(conn.peer_address().bytes());

    let ret = unsafe {
        raw::sd_ble_gap_tx_power_set(
            raw::BLE_GAP_TX_POWER_ROLES_BLE_GAP_TX_POWER_ROLE_CONN as u8,
            handle,
            config::TX_POWER_DBM,
        )
    };
    if ret != raw::NRF_SUCCESS {
        warn!("sd_ble_gap_tx_power_set: {}", ret);
    }

    let params = raw::ble_gap_conn_params_t {
        min_conn_interval: config::CONN_INTERVAL_MIN,
        max_conn_interval: config::CONN_INTERVAL_MAX,
        slave_latency: config::CONN_SLAVE_LATENCY,
        conn_sup_timeout: config::CONN_SUP_TIMEOUT,
    };
    if let Err(err) = conn.set_conn_params(params) {
        warn!("set_conn_params: {:?}", err);
    }

    with_server(|server| {
        server.link_mut().attach(conn.clone());
        server.handle_event(BleEvent::Connected {
            conn: ConnHandle(handle),
            peer,
        });
    });

    let _ = gatt_server::run(&conn, gatt, |_| {}).await;

    with_server(|server| {
        server.link_mut().detach();
        server.handle_event(BleEvent::Disconnected {
            conn: ConnHandle(handle),
            reason: None,
        });
    });
}

fn adv_data() -> Vec<u8, 31> {
    let name = config::DEVICE_NAME.as_bytes();
    let mut data = Vec::new();
    #[rustfmt::skip]
    let _ = data.extend_from_slice(&[
        0x02, 0x01, raw::BLE_GAP_ADV_FLAGS_LE_ONLY_GENERAL_DISC_MODE as u8,
        1 + name.len() as u8, 0x09, // Complete local name
    ]);
    let _ = data.extend_from_slice(name);
    data
}

fn scan_data() -> [u8; 18] {
    let mut data = [0u8; 18];
    data[0] = 0x11;
    data[1] = 0x07; // Complete list of 128-bit service UUIDs
    data[2..].copy_from_slice(&vendor_uuid_bytes(config::SERVICE_UUID));
    data
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("bleadv {} starting", config::SW_VERSION);

    // SoftDevice reserves priorities 0, 1 and 4.
    let mut nrf_config = embassy_nrf::config::Config::default();
    nrf_config.gpiote_interrupt_priority = Priority::P2;
    nrf_config.time_interrupt_priority = Priority::P2;
    let _p = embassy_nrf::init(nrf_config);

    let sd_config = nrf_softdevice::Config {
        clock: Some(raw::nrf_clock_lf_cfg_t {
            source: raw::NRF_CLOCK_LF_SRC_XTAL as u8,
            rc_ctiv: 0,
            rc_temp_ctiv: 0,
            accuracy: raw::NRF_CLOCK_LF_ACCURACY_50_PPM as u8,
        }),
        conn_gap: Some(raw::ble_gap_conn_cfg_t {
            conn_count: 1,
            event_length: 24,
        }),
        conn_gatt: Some(raw::ble_gatt_conn_cfg_t { att_mtu: 23 }),
        gatts_attr_tab_size: Some(raw::ble_gatts_cfg_attr_tab_size_t {
            attr_tab_size: raw::BLE_GATTS_ATTR_TAB_SIZE_DEFAULT,
        }),
        gap_role_count: Some(raw::ble_gap_cfg_role_count_t {
            adv_set_count: 1,
            periph_role_count: 1,
            central_role_count: 0,
            central_sec_count: 0,
            _bitfield_1: raw::ble_gap_cfg_role_count_t::new_bitfield_1(0),
        }),
        gap_device_name: Some(raw::ble_gap_cfg_device_name_t {
            p_value: config::DEVICE_NAME.as_ptr() as _,
            current_len: config::DEVICE_NAME.len() as u16,
            max_len: config::DEVICE_NAME.len() as u16,
            write_perm: unsafe { core::mem::zeroed() },
            _bitfield_1: raw::ble_gap_cfg_device_name_t::new_bitfield_1(
                raw::BLE_GATTS_VLOC_STACK as u8,
            ),
        }),
        ..Default::default()
    };

    let sd = Softdevice::enable(&sd_config);
    let gatt = GATT.init(unwrap!(GattTable::build(sd)));
    let sd: &'static Softdevice = sd;

    let mut server = Server::new(REGISTRY, Advertiser::new(), SdLink::new());
    server.start();
    softdevice::install(server);

    unwrap!(spawner.spawn(softdevice_task(sd)));
    unwrap!(spawner.spawn(advertiser_task(sd, gatt)));
    unwrap!(spawner.spawn(worker_task()));
}
